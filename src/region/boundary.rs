use anyhow::Result;
use geo::{BoundingRect, Contains, MultiPolygon, Point};
use serde::{Deserialize, Serialize};

use crate::api::Poi;

/// Axis-aligned cell in service coordinates (longitude/latitude)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl BoundingBox {
    pub fn new(left: f64, bottom: f64, right: f64, top: f64) -> Self {
        Self { left, bottom, right, top }
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.left + self.width() / 2.0,
            self.bottom + self.height() / 2.0,
        )
    }

    /// Split at the midpoints into four equal cells.
    /// Neighbouring quadrants share their edge coordinates exactly.
    pub fn quadrants(&self) -> [BoundingBox; 4] {
        let (mid_x, mid_y) = self.center();
        [
            Self::new(self.left, self.bottom, mid_x, mid_y),
            Self::new(self.left, mid_y, mid_x, self.top),
            Self::new(mid_x, self.bottom, self.right, mid_y),
            Self::new(mid_x, mid_y, self.right, self.top),
        ]
    }

    /// Two-corner polygon parameter, `left,top|right,bottom`
    pub fn to_polygon_param(&self) -> String {
        format!("{},{}|{},{}", self.left, self.top, self.right, self.bottom)
    }

    pub fn contains(&self, lng: f64, lat: f64) -> bool {
        lng >= self.left && lng <= self.right && lat >= self.bottom && lat <= self.top
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryKind {
    Administrative,
    Rectangle,
    Custom,
}

impl BoundaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoundaryKind::Administrative => "administrative",
            BoundaryKind::Rectangle => "rectangle",
            BoundaryKind::Custom => "custom",
        }
    }
}

/// Exact crawl region. Cells are fetched over `bbox`; `contains` trims the
/// over-fetched results back to the true shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boundary {
    pub kind: BoundaryKind,
    pub label: String,
    pub bbox: BoundingBox,
    /// Polygons with their holes; `None` for a plain rectangle
    pub shape: Option<MultiPolygon<f64>>,
}

impl Boundary {
    pub fn rectangle(bbox: BoundingBox, label: impl Into<String>) -> Self {
        Self {
            kind: BoundaryKind::Rectangle,
            label: label.into(),
            bbox,
            shape: None,
        }
    }

    pub fn from_shape(kind: BoundaryKind, label: impl Into<String>, shape: MultiPolygon<f64>) -> Result<Self> {
        let rect = shape
            .bounding_rect()
            .ok_or_else(|| anyhow::anyhow!("Boundary contains no coordinates"))?;
        let bbox = BoundingBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y);

        Ok(Self {
            kind,
            label: label.into(),
            bbox,
            shape: Some(shape),
        })
    }

    pub fn contains(&self, lng: f64, lat: f64) -> bool {
        if !self.bbox.contains(lng, lat) {
            return false;
        }
        match &self.shape {
            Some(shape) => shape.contains(&Point::new(lng, lat)),
            None => true,
        }
    }

    /// Containment predicate for results; items without a usable location are dropped
    pub fn contains_poi(&self, poi: &Poi) -> bool {
        poi.lng_lat()
            .map(|(lng, lat)| self.contains(lng, lat))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    #[test]
    fn test_quadrants_tile_the_parent() {
        let bbox = BoundingBox::new(114.0, 30.0, 115.0, 31.0);
        let quadrants = bbox.quadrants();

        let total: f64 = quadrants.iter().map(|q| q.area()).sum();
        assert!((total - bbox.area()).abs() < 1e-12);
        assert_eq!(quadrants[0].right, quadrants[2].left);
        assert_eq!(quadrants[0].top, quadrants[1].bottom);
    }

    #[test]
    fn test_polygon_param() {
        let bbox = BoundingBox::new(114.5, 30.25, 115.0, 31.0);
        assert_eq!(bbox.to_polygon_param(), "114.5,31|115,30.25");
    }

    #[test]
    fn test_triangle_containment() {
        let triangle = polygon![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 0.0, y: 10.0)];
        let boundary =
            Boundary::from_shape(BoundaryKind::Custom, "triangle", MultiPolygon(vec![triangle])).unwrap();

        assert_eq!(boundary.bbox, BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        assert!(boundary.contains(2.0, 2.0));
        assert!(!boundary.contains(8.0, 8.0));
        assert!(!boundary.contains(-1.0, 2.0));
    }

    #[test]
    fn test_points_in_holes_are_outside() {
        let with_hole = polygon!(
            exterior: [(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0), (x: 0.0, y: 10.0)],
            interiors: [[(x: 4.0, y: 4.0), (x: 6.0, y: 4.0), (x: 6.0, y: 6.0), (x: 4.0, y: 6.0)]],
        );
        let boundary =
            Boundary::from_shape(BoundaryKind::Administrative, "enclave", MultiPolygon(vec![with_hole])).unwrap();

        assert!(boundary.contains(2.0, 2.0));
        assert!(!boundary.contains(5.0, 5.0));
    }

    #[test]
    fn test_shape_survives_serialization() {
        let square = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)];
        let boundary = Boundary::from_shape(BoundaryKind::Custom, "square", MultiPolygon(vec![square])).unwrap();

        let json = serde_json::to_string(&boundary).unwrap();
        let restored: Boundary = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, boundary);
        assert!(restored.contains(0.5, 0.5));
    }

    #[test]
    fn test_poi_without_location_is_filtered() {
        let boundary = Boundary::rectangle(BoundingBox::new(0.0, 0.0, 1.0, 1.0), "unit");
        let inside = Poi {
            location: Some("0.5,0.5".to_string()),
            ..Default::default()
        };

        assert!(boundary.contains_poi(&inside));
        assert!(!boundary.contains_poi(&Poi::default()));
    }

    #[test]
    fn test_empty_shape_is_rejected() {
        assert!(Boundary::from_shape(BoundaryKind::Custom, "empty", MultiPolygon(vec![])).is_err());
    }
}
