use std::fmt;

/// Numeric type an attribute is declared with inside a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    U8,
    U16,
    F32,
    F64,
}

/// One attribute of the unified point model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Attribute {
    Position,
    Color,
    Intensity,
    Classification,
    Normal,
    GpsTime,
    /// Format specific scalar field, carried as f64.
    Scalar(String),
}

impl Attribute {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Attribute::Position => ScalarType::F64,
            Attribute::Color => ScalarType::U16,
            Attribute::Intensity => ScalarType::U16,
            Attribute::Classification => ScalarType::U8,
            Attribute::Normal => ScalarType::F32,
            Attribute::GpsTime => ScalarType::F64,
            Attribute::Scalar(_) => ScalarType::F64,
        }
    }

    /// Number of scalar components per point.
    pub fn components(&self) -> usize {
        match self {
            Attribute::Position | Attribute::Color | Attribute::Normal => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Position => write!(f, "position"),
            Attribute::Color => write!(f, "color"),
            Attribute::Intensity => write!(f, "intensity"),
            Attribute::Classification => write!(f, "classification"),
            Attribute::Normal => write!(f, "normal"),
            Attribute::GpsTime => write!(f, "gps_time"),
            Attribute::Scalar(name) => write!(f, "{}", name),
        }
    }
}

/// The fixed, ordered set of attributes of a stream. Computed once when a source is opened and
/// never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    attributes: Vec<Attribute>,
}

impl Schema {
    /// Builds a schema with `Position` first, followed by the given attributes in order.
    /// Duplicates are ignored.
    pub fn new<I: IntoIterator<Item = Attribute>>(attributes: I) -> Self {
        let mut schema = Schema {
            attributes: vec![Attribute::Position],
        };
        for attribute in attributes {
            if !schema.attributes.contains(&attribute) {
                schema.attributes.push(attribute);
            }
        }
        schema
    }

    /// A schema without any attribute, not even a position. No sink accepts it.
    pub fn empty() -> Self {
        Schema {
            attributes: Vec::new(),
        }
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn contains(&self, attribute: &Attribute) -> bool {
        self.attributes.contains(attribute)
    }

    pub fn has_position(&self) -> bool {
        self.contains(&Attribute::Position)
    }

    /// Names of the extra scalar fields, in stream order.
    pub fn scalar_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().filter_map(|a| match a {
            Attribute::Scalar(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Splits the schema into what `keep` accepts and what has to be dropped. Relative order is
    /// preserved on both sides.
    pub fn partition<F: Fn(&Attribute) -> bool>(&self, keep: F) -> (Schema, Vec<Attribute>) {
        let (kept, dropped): (Vec<_>, Vec<_>) = self
            .attributes
            .iter()
            .cloned()
            .partition(|a| *a == Attribute::Position || keep(a));
        (Schema { attributes: kept }, dropped)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.attributes.iter().map(|a| a.to_string()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}
