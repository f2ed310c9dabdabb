use serde::{Deserialize, Serialize};

/// A sub-rectangle of the source frame, in source-pixel units.
///
/// Always non-degenerate (`width > 0 && height > 0`) once constructed via
/// [`Rectangle::clipped`] — the only public constructor — so downstream code
/// never has to re-check for a zero-area rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rectangle {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Rejected rectangle inputs (§3, §8 boundary behaviors).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RectangleError {
    #[error("rectangle has zero area")]
    ZeroArea,
}

impl Rectangle {
    /// Build a rectangle from raw (possibly non-integer) admin input,
    /// rounding half-to-even and clipping to `geometry` if given.
    ///
    /// Matches §4.5's numeric policy: round first, then clip to source
    /// bounds, then reject if the clipped result has zero area.
    pub fn clipped(
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        geometry: Option<StreamGeometry>,
    ) -> Result<Self, RectangleError> {
        let round = |v: f64| -> i64 { v.round_ties_even() as i64 };

        let mut x = round(x).max(0);
        let mut y = round(y).max(0);
        let mut width = round(width).max(0);
        let mut height = round(height).max(0);

        if let Some(geom) = geometry {
            let (sw, sh) = (geom.width as i64, geom.height as i64);
            x = x.min(sw);
            y = y.min(sh);
            width = width.min(sw.saturating_sub(x));
            height = height.min(sh.saturating_sub(y));
        }

        if width <= 0 || height <= 0 {
            return Err(RectangleError::ZeroArea);
        }

        Ok(Self {
            x: x as u32,
            y: y as u32,
            width: width as u32,
            height: height as u32,
        })
    }

    /// Construct directly from already-valid integer parts (used by
    /// internal code and tests that don't need rounding/clipping).
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Result<Self, RectangleError> {
        if width == 0 || height == 0 {
            return Err(RectangleError::ZeroArea);
        }
        Ok(Self { x, y, width, height })
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether this rectangle, unchanged in size, would still fit inside
    /// `geometry` (used to decide whether a region update is a pure-offset
    /// retarget or requires reclipping).
    pub fn fits(&self, geometry: StreamGeometry) -> bool {
        self.x + self.width <= geometry.width && self.y + self.height <= geometry.height
    }
}

/// The source frame's dimensions in pixels, set when a broadcaster
/// publishes and cleared when it ends (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamGeometry {
    pub width: u32,
    pub height: u32,
}

impl StreamGeometry {
    pub fn new(width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            None
        } else {
            Some(Self { width, height })
        }
    }
}

/// Authoritative per-viewer record, keyed by the stable `clientId` (§3).
///
/// Survives disconnects: `connected` flips, `transport_id` is cleared, but
/// the record (and its `region`) stays in the registry until GC'd by TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerRecord {
    pub client_id: String,
    pub transport_id: Option<String>,
    pub display_name: Option<String>,
    pub connected: bool,
    pub region: Option<Rectangle>,
    /// Unix epoch milliseconds. Non-decreasing across successive snapshots
    /// of the same `client_id` (Invariant 6 / §8 roster monotonicity).
    pub last_seen_at: u64,
}

impl ViewerRecord {
    pub fn new(client_id: impl Into<String>, transport_id: String, now_ms: u64) -> Self {
        Self {
            client_id: client_id.into(),
            transport_id: Some(transport_id),
            display_name: None,
            connected: true,
            region: None,
            last_seen_at: now_ms,
        }
    }

    /// A Viewer Session should exist for this record iff it's connected
    /// and has a region assigned (§3 lifecycle, §8 session parity).
    pub fn wants_session(&self) -> bool {
        self.connected && self.region.is_some()
    }
}

/// At most one active at a time (Invariant 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcasterRecord {
    pub transport_id: String,
    pub geometry: StreamGeometry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clipped_rejects_zero_area() {
        let err = Rectangle::clipped(0.0, 0.0, 0.0, 100.0, None).unwrap_err();
        assert_eq!(err, RectangleError::ZeroArea);
    }

    #[test]
    fn clipped_rounds_half_to_even() {
        let r = Rectangle::clipped(0.5, 0.5, 10.5, 10.5, None).unwrap();
        // 0.5 -> 0 (round to even), 10.5 -> 10 (round to even)
        assert_eq!(r.x, 0);
        assert_eq!(r.y, 0);
        assert_eq!(r.width, 10);
        assert_eq!(r.height, 10);
    }

    #[test]
    fn clipped_clamps_to_geometry() {
        let geom = StreamGeometry::new(1920, 1080).unwrap();
        let r = Rectangle::clipped(1900.0, 1000.0, 200.0, 200.0, Some(geom)).unwrap();
        assert_eq!(r.x, 1900);
        assert_eq!(r.y, 1000);
        assert_eq!(r.width, 20);
        assert_eq!(r.height, 80);
    }

    #[test]
    fn clipped_out_of_bounds_origin_is_zero_area() {
        let geom = StreamGeometry::new(640, 480).unwrap();
        let err = Rectangle::clipped(640.0, 0.0, 100.0, 100.0, Some(geom)).unwrap_err();
        assert_eq!(err, RectangleError::ZeroArea);
    }

    #[test]
    fn new_rejects_zero_dimensions() {
        assert!(Rectangle::new(0, 0, 0, 10).is_err());
        assert!(Rectangle::new(0, 0, 10, 0).is_err());
        assert!(Rectangle::new(0, 0, 10, 10).is_ok());
    }

    #[test]
    fn fits_detects_overflow() {
        let geom = StreamGeometry::new(1920, 1080).unwrap();
        let inside = Rectangle::new(1000, 900, 800, 100).unwrap();
        assert!(inside.fits(geom));

        let overflowing = Rectangle::new(1500, 900, 800, 100).unwrap();
        assert!(!overflowing.fits(geom));
    }

    #[test]
    fn viewer_record_wants_session_requires_connected_and_region() {
        let mut rec = ViewerRecord::new("wall-a", "t1".into(), 0);
        assert!(!rec.wants_session());
        rec.region = Some(Rectangle::new(0, 0, 10, 10).unwrap());
        assert!(rec.wants_session());
        rec.connected = false;
        assert!(!rec.wants_session());
    }

    #[test]
    fn stream_geometry_rejects_zero() {
        assert!(StreamGeometry::new(0, 100).is_none());
        assert!(StreamGeometry::new(100, 0).is_none());
        assert!(StreamGeometry::new(100, 100).is_some());
    }
}
