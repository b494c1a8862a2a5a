//! Various utilities functions and types

mod clock;
mod geometry;
mod region;

pub use self::clock::{refresh_period, PresentationClock};
pub use self::geometry::{Buffer, Coordinate, Logical, Physical, Point, Rectangle, Size, Transform};
pub use self::region::Region;
