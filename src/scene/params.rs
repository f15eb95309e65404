use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Int(Vec<i32>),
    Bool(Vec<bool>),
    Float(Vec<f32>),
    String(Vec<String>),
    Texture(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: ParamValue,
}

/// Ordered parameter list of one scene command. Adding a name that already exists
/// replaces the previous value in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    params: Vec<Param>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    pub fn add(&mut self, name: &str, value: ParamValue) {
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.value = value,
            None => self.params.push(Param {
                name: name.to_string(),
                value,
            }),
        }
    }

    pub fn add_int(&mut self, name: &str, value: i32) {
        self.add(name, ParamValue::Int(vec![value]));
    }

    pub fn add_bool(&mut self, name: &str, value: bool) {
        self.add(name, ParamValue::Bool(vec![value]));
    }

    pub fn add_floats(&mut self, name: &str, values: &[f32]) {
        self.add(name, ParamValue::Float(values.to_vec()));
    }

    pub fn add_string(&mut self, name: &str, value: &str) {
        self.add(name, ParamValue::String(vec![value.to_string()]));
    }

    pub fn add_texture(&mut self, name: &str, texture: &str) {
        self.add(name, ParamValue::Texture(texture.to_string()));
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn find_one_string(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            ParamValue::String(values) => values.first().map(String::as_str),
            _ => None,
        }
    }

    pub fn find_one_int(&self, name: &str) -> Option<i32> {
        match self.get(name)? {
            ParamValue::Int(values) => values.first().copied(),
            _ => None,
        }
    }

    pub fn find_one_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ParamValue::Bool(values) => values.first().copied(),
            _ => None,
        }
    }

    pub fn erase(&mut self, name: &str) -> bool {
        let before = self.params.len();
        self.params.retain(|p| p.name != name);
        before != self.params.len()
    }

    /// True when the file behind `name` travels inline as `<name>_data`.
    pub fn has_embedded_data(&self, name: &str) -> bool {
        self.find_one_string(&format!("{name}_data")).is_some()
    }
}
