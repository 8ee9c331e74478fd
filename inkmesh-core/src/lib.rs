//! # inkmesh-core: stroke model and canvas replica
//!
//! Every participant of a shared canvas holds its own [`CanvasReplica`].
//! Strokes are immutable once created and travel between peers by value;
//! the replica only ever adds whole strokes or removes them by id.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub mod replica;

pub use replica::{AddOutcome, CanvasReplica, MergeOutcome};

/// Position in canvas (world) coordinates.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    #[default]
    Pen,
    Eraser,
}

/// A CSS color string (`#ff6b6b`, `hsl(210, 70%, 60%)`, ...).
///
/// Colors are opaque to the mesh; only the renderer interprets them.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Color(String);

impl Color {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Random vivid color: random hue, fixed saturation and lightness.
    pub fn random() -> Self {
        let hue: u16 = rand::thread_rng().gen_range(0..360);
        Self::from_hue(hue)
    }

    pub fn from_hue(hue: u16) -> Self {
        Self(format!("hsl({}, 70%, 60%)", hue % 360))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::new("#ffffff")
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique stroke identifier.
///
/// Generated ids combine a millisecond timestamp with 128 random bits, so
/// two participants drawing at the same instant still never collide.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct StrokeId(String);

impl StrokeId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self(format!("{}-{}", to_base36(millis), Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StrokeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StrokeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for StrokeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A finished pen or eraser stroke.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Stroke {
    pub id: StrokeId,
    pub tool: Tool,
    pub color: Color,
    #[serde(alias = "size")]
    pub width: f64,
    pub points: Vec<Point>,
}

impl Stroke {
    /// Start a stroke with a fresh id and no points.
    pub fn new(tool: Tool, color: Color, width: f64) -> Self {
        Self {
            id: StrokeId::generate(),
            tool,
            color,
            width,
            points: Vec::new(),
        }
    }

    /// Builder used by tests and headless clients that know the id already.
    pub fn with_id(id: impl Into<StrokeId>, points: Vec<Point>) -> Self {
        Self {
            id: id.into(),
            tool: Tool::Pen,
            color: Color::default(),
            width: 3.0,
            points,
        }
    }

    pub fn push_point(&mut self, point: Point) {
        self.points.push(point);
    }

    /// Straight two-point pen stroke.
    pub fn line(from: Point, to: Point, color: Color, width: f64) -> Self {
        let mut stroke = Self::new(Tool::Pen, color, width);
        stroke.push_point(from);
        stroke.push_point(to);
        stroke
    }
}

/// Lowercase base-36 rendering of an integer.
pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
