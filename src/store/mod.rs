//! Record stores for the three version-chained kinds plus ownership policy.

pub mod entity;
pub mod ownership;
pub mod tag_def;
pub mod tag_instance;

pub use entity::{DisplayTxtInfo, DisplayTxtSource, EntityDraft, EntityRecord, EntityStore};
pub use ownership::{OwnershipRequest, OwnershipStore};
pub use tag_def::{TagDefDraft, TagDefRecord, TagDefStore, TagType};
pub use tag_instance::{TagInstanceDraft, TagInstanceRecord, TagInstanceStore};
