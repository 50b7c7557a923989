pub mod identity;
pub mod image;
pub mod record;
pub mod unpack;

pub use identity::RecordIdentity;
pub use image::{ImageReference, ImageReferenceResolver};
pub use record::{FlatRecord, LabelScores, RawItem, StoredAdvert};
pub use unpack::KeyPathUnpacker;
