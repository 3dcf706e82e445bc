//! Robust geometric infrastructure: exact arithmetic, spatial queries, and
//! convex hull construction.

pub mod contact;
pub mod convex_hull;
pub mod exact;
pub(crate) mod point_tree;

pub use contact::TireContact;
pub use convex_hull::ConvexHull3;
pub use exact::Expansion;
