use indexmap::IndexMap;

/// One measured spot: a reference material or an unknown.
///
/// Scalar quantities are stored as one-element sequences; per-scan quantities
/// keep one value per scan.
#[derive(Clone, Debug, PartialEq)]
pub struct Fraction {
    name: String,
    is_reference_material: bool,
    values: IndexMap<String, Vec<f64>>,
}

impl Fraction {
    pub fn unknown(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_reference_material: false,
            values: IndexMap::new(),
        }
    }

    pub fn reference_material(name: impl Into<String>) -> Self {
        Self {
            is_reference_material: true,
            ..Self::unknown(name)
        }
    }

    pub fn with_value(self, quantity: impl Into<String>, value: f64) -> Self {
        self.with_values(quantity, vec![value])
    }

    pub fn with_values(mut self, quantity: impl Into<String>, values: Vec<f64>) -> Self {
        self.values.insert(quantity.into(), values);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_reference_material(&self) -> bool {
        self.is_reference_material
    }

    pub fn get(&self, quantity: &str) -> Option<&[f64]> {
        self.values.get(quantity).map(Vec::as_slice)
    }

    pub fn quantities(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl AsRef<Fraction> for Fraction {
    fn as_ref(&self) -> &Fraction {
        self
    }
}
