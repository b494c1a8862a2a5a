use smallvec::SmallVec;

use super::geometry::{Coordinate, Rectangle};

/// A union of rectangles
///
/// Rectangles are stored as added, without merging. That is enough for
/// intersection queries, which is all the plane assignment asks of it.
#[derive(Debug)]
pub struct Region<N, Kind> {
    rects: SmallVec<[Rectangle<N, Kind>; 8]>,
}

impl<N: Coordinate, Kind> Default for Region<N, Kind> {
    fn default() -> Self {
        Region {
            rects: SmallVec::new(),
        }
    }
}

impl<N: Coordinate, Kind> Region<N, Kind> {
    /// Create an empty region
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rectangle to the region, empty rectangles are ignored
    pub fn add(&mut self, rect: Rectangle<N, Kind>) {
        if !rect.is_empty() {
            self.rects.push(rect);
        }
    }

    /// Returns true if `rect` shares any area with this region
    pub fn overlaps(&self, rect: Rectangle<N, Kind>) -> bool {
        self.rects.iter().any(|r| r.overlaps(rect))
    }

    /// Returns true if the region covers no area
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Smallest rectangle containing the whole region
    pub fn extents(&self) -> Rectangle<N, Kind> {
        self.rects
            .iter()
            .fold(Rectangle::default(), |acc, rect| acc.merge(*rect))
    }

    /// Iterate the rectangles making up this region
    pub fn rects(&self) -> impl Iterator<Item = &Rectangle<N, Kind>> {
        self.rects.iter()
    }

    /// Remove every rectangle
    pub fn clear(&mut self) {
        self.rects.clear();
    }
}

impl<N: Coordinate, Kind> FromIterator<Rectangle<N, Kind>> for Region<N, Kind> {
    fn from_iter<T: IntoIterator<Item = Rectangle<N, Kind>>>(iter: T) -> Self {
        let mut region = Region::new();
        for rect in iter {
            region.add(rect);
        }
        region
    }
}
