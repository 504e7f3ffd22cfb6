pub mod boundary;
pub mod resolver;

// Re-export common types
pub use boundary::{Boundary, BoundaryKind, BoundingBox};
pub use resolver::{BoundaryResolver, CoordinateSystem, DefaultResolver, RegionSpec};
