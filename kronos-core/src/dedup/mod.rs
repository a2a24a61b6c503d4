//! Cross-provider identity resolution.
//!
//! The same meeting often shows up in several of a user's calendars. This
//! module scores candidate pairs ([`MergeMatcher`]) and folds a normalized
//! delta into the stored timeline ([`MergeResolver`]), merging matches into
//! one canonical event with several source refs.

mod resolver;
mod similarity;

pub use resolver::{MergeOutcome, MergeResolver};
pub use similarity::{
    MatchResult, MergeMatcher, attendee_overlap, normalize_title, title_similarity,
};
