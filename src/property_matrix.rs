//! Environment matrix expansion.
//!
//! Scalar properties go into every cell. List properties span a Cartesian
//! product in declaration order, the last one varying fastest. A cell's code
//! is its list values joined with `_`.

use crate::entity::{EnvProperty, Environment, PropertyValue};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatrixCell {
    /// Empty when the environment has no list property.
    pub code: String,
    /// Every property of the cell, in declaration order.
    pub properties: Vec<(String, String)>,
}

impl MatrixCell {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertyMatrix {
    properties: Vec<EnvProperty>,
}

impl PropertyMatrix {
    pub fn new(properties: Vec<EnvProperty>) -> Self {
        let properties = properties
            .into_iter()
            .filter(|p| !matches!(&p.value, PropertyValue::List(v) if v.is_empty()))
            .collect();
        Self { properties }
    }

    pub fn from_environment(env: &Environment) -> Self {
        Self::new(env.folded_properties())
    }

    pub fn cells(&self) -> Vec<MatrixCell> {
        let mut cells = vec![(Vec::<String>::new(), Vec::<(String, String)>::new())];
        for prop in &self.properties {
            match &prop.value {
                PropertyValue::Scalar(value) => {
                    for (_, props) in &mut cells {
                        props.push((prop.name.clone(), value.clone()));
                    }
                }
                PropertyValue::List(values) => {
                    cells = cells
                        .into_iter()
                        .flat_map(|(code, props)| {
                            values.iter().map(move |value| {
                                let mut code = code.clone();
                                code.push(value.clone());
                                let mut props = props.clone();
                                props.push((prop.name.clone(), value.clone()));
                                (code, props)
                            })
                        })
                        .collect();
                }
            }
        }
        cells
            .into_iter()
            .map(|(code, properties)| MatrixCell {
                code: code.join("_"),
                properties,
            })
            .collect()
    }
}
