use super::schema::{Attribute, Schema};

/// Number of points moved through the pipeline at once.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Axis aligned bounds of a set of positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Bounds {
    pub fn from_point(p: [f64; 3]) -> Self {
        Bounds { min: p, max: p }
    }

    pub fn extend(&mut self, p: [f64; 3]) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(p[axis]);
            self.max[axis] = self.max[axis].max(p[axis]);
        }
    }

    pub fn merge(&mut self, other: &Bounds) {
        self.extend(other.min);
        self.extend(other.max);
    }
}

/// A single point in row form. Readers fill one of these per point and push it into a chunk;
/// fields the stream schema lacks are ignored by the chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointRecord {
    pub position: [f64; 3],
    pub color: [u16; 3],
    pub intensity: u16,
    pub classification: u8,
    pub normal: [f32; 3],
    pub gps_time: f64,
    /// Values for the schema's scalar fields, in schema order.
    pub scalars: Vec<f64>,
}

/// A bounded batch of points stored column by column. The set of present columns always
/// matches the schema the chunk was created for.
#[derive(Debug, Clone, PartialEq)]
pub struct PointChunk {
    pub positions: Vec<[f64; 3]>,
    pub colors: Option<Vec<[u16; 3]>>,
    pub intensities: Option<Vec<u16>>,
    pub classifications: Option<Vec<u8>>,
    pub normals: Option<Vec<[f32; 3]>>,
    pub gps_times: Option<Vec<f64>>,
    pub scalars: Vec<(String, Vec<f64>)>,
}

impl PointChunk {
    pub fn for_schema(schema: &Schema, capacity: usize) -> Self {
        let column = |attribute: &Attribute| schema.contains(attribute);
        PointChunk {
            positions: Vec::with_capacity(capacity),
            colors: column(&Attribute::Color).then(|| Vec::with_capacity(capacity)),
            intensities: column(&Attribute::Intensity).then(|| Vec::with_capacity(capacity)),
            classifications: column(&Attribute::Classification)
                .then(|| Vec::with_capacity(capacity)),
            normals: column(&Attribute::Normal).then(|| Vec::with_capacity(capacity)),
            gps_times: column(&Attribute::GpsTime).then(|| Vec::with_capacity(capacity)),
            scalars: schema
                .scalar_names()
                .map(|name| (name.to_string(), Vec::with_capacity(capacity)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn push(&mut self, point: &PointRecord) {
        self.positions.push(point.position);
        if let Some(colors) = self.colors.as_mut() {
            colors.push(point.color);
        }
        if let Some(intensities) = self.intensities.as_mut() {
            intensities.push(point.intensity);
        }
        if let Some(classifications) = self.classifications.as_mut() {
            classifications.push(point.classification);
        }
        if let Some(normals) = self.normals.as_mut() {
            normals.push(point.normal);
        }
        if let Some(gps_times) = self.gps_times.as_mut() {
            gps_times.push(point.gps_time);
        }
        for (i, (_, values)) in self.scalars.iter_mut().enumerate() {
            values.push(point.scalars.get(i).copied().unwrap_or(0.0));
        }
    }

    /// Removes every column `schema` does not list.
    pub fn restrict_to(&mut self, schema: &Schema) {
        if !schema.contains(&Attribute::Color) {
            self.colors = None;
        }
        if !schema.contains(&Attribute::Intensity) {
            self.intensities = None;
        }
        if !schema.contains(&Attribute::Classification) {
            self.classifications = None;
        }
        if !schema.contains(&Attribute::Normal) {
            self.normals = None;
        }
        if !schema.contains(&Attribute::GpsTime) {
            self.gps_times = None;
        }
        self.scalars
            .retain(|(name, _)| schema.contains(&Attribute::Scalar(name.clone())));
    }

    pub fn scalar(&self, name: &str) -> Option<&[f64]> {
        self.scalars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
    }

    pub fn bounds(&self) -> Option<Bounds> {
        let (first, rest) = self.positions.split_first()?;
        let mut bounds = Bounds::from_point(*first);
        for p in rest {
            bounds.extend(*p);
        }
        Some(bounds)
    }

    /// True if every present column holds exactly one value per point.
    pub fn is_consistent(&self) -> bool {
        let n = self.len();
        self.colors.as_ref().map_or(true, |c| c.len() == n)
            && self.intensities.as_ref().map_or(true, |c| c.len() == n)
            && self.classifications.as_ref().map_or(true, |c| c.len() == n)
            && self.normals.as_ref().map_or(true, |c| c.len() == n)
            && self.gps_times.as_ref().map_or(true, |c| c.len() == n)
            && self.scalars.iter().all(|(_, c)| c.len() == n)
    }
}

/// Widens an 8 bit color channel to the model's 16 bit range.
pub fn widen_color(value: u8) -> u16 {
    value as u16 * 257
}

/// Scales a 16 bit color channel down for 8 bit formats.
pub fn narrow_color(value: u16) -> u8 {
    (value >> 8) as u8
}
