//! The unified point model every reader produces and every writer consumes.

mod chunk;
mod schema;

pub use self::chunk::{narrow_color, widen_color, Bounds, PointChunk, PointRecord, CHUNK_SIZE};
pub use self::schema::{Attribute, ScalarType, Schema};
