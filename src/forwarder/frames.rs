//! Sensor frames and their wire encoding
//!
//! Both stream types travel as lowercase hex text so they fit a text payload
//! channel:
//!
//! ```text
//! PointCloud: N points ─► 3N f32 (x, y, z row-major, little-endian) ─► hex
//! Image:      step * height raw bytes ─────────────────────────────────► hex
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::ForwardError;

const POINT_BYTES: usize = 3 * std::mem::size_of::<f32>();

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point32 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point32 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    pub points: Vec<Point32>,
}

impl PointCloud {
    pub fn from_tuples(points: &[(f32, f32, f32)]) -> Self {
        Self {
            points: points
                .iter()
                .map(|&(x, y, z)| Point32::new(x, y, z))
                .collect(),
        }
    }
}

/// Raw camera image; `data` holds `step` bytes for each of `height` rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub height: u32,
    pub width: u32,
    pub encoding: String,
    /// Row length in bytes
    pub step: u32,
    pub data: Vec<u8>,
}

/// One message from a local sensor topic.
///
/// On the local broker a frame is the JSON form of its payload struct; the
/// variant is recognised by its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorFrame {
    PointCloud(PointCloud),
    Image(Image),
}

impl SensorFrame {
    pub fn kind(&self) -> StreamKind {
        match self {
            SensorFrame::PointCloud(_) => StreamKind::PointCloud,
            SensorFrame::Image(_) => StreamKind::Image,
        }
    }
}

/// Stream type handled by a forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    PointCloud,
    Image,
}

impl StreamKind {
    pub fn name(self) -> &'static str {
        match self {
            StreamKind::PointCloud => "point_cloud",
            StreamKind::Image => "image",
        }
    }

    /// Encodes a frame of this stream type into its hex payload.
    pub fn encode(self, frame: &SensorFrame) -> Result<String, ForwardError> {
        match (self, frame) {
            (StreamKind::PointCloud, SensorFrame::PointCloud(cloud)) => {
                Ok(encode_point_cloud(cloud))
            }
            (StreamKind::Image, SensorFrame::Image(image)) => encode_image(image),
            (expected, other) => Err(ForwardError::UnexpectedFrame {
                expected: expected.name(),
                actual: other.kind().name(),
            }),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub fn encode_point_cloud(cloud: &PointCloud) -> String {
    let mut buf = Vec::with_capacity(cloud.points.len() * POINT_BYTES);
    for point in &cloud.points {
        for coord in [point.x, point.y, point.z] {
            buf.extend_from_slice(&coord.to_le_bytes());
        }
    }
    hex::encode(buf)
}

/// Inverse of [`encode_point_cloud`], used by host-side consumers.
pub fn decode_point_cloud(payload: &str) -> Result<PointCloud, ForwardError> {
    let bytes = hex::decode(payload).map_err(|e| ForwardError::InvalidPayload(e.to_string()))?;
    if bytes.len() % POINT_BYTES != 0 {
        return Err(ForwardError::InvalidPayload(format!(
            "{} bytes is not a whole number of points",
            bytes.len()
        )));
    }

    let points = bytes
        .chunks_exact(POINT_BYTES)
        .map(|chunk| {
            let coord = |i: usize| {
                f32::from_le_bytes([chunk[i], chunk[i + 1], chunk[i + 2], chunk[i + 3]])
            };
            Point32::new(coord(0), coord(4), coord(8))
        })
        .collect();
    Ok(PointCloud { points })
}

pub fn encode_image(image: &Image) -> Result<String, ForwardError> {
    let expected = image.step as usize * image.height as usize;
    if image.data.len() != expected {
        return Err(ForwardError::MalformedFrame(format!(
            "image declares {}x{} rows of {} bytes but carries {} bytes",
            image.height,
            image.width,
            image.step,
            image.data.len()
        )));
    }
    Ok(hex::encode(&image.data))
}
