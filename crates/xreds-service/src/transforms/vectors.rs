use indexmap::IndexMap;
use serde_json::Value;

use crate::dataset::Dataset;

use super::{Transform, TransformError};

/// Adds speed and direction variables for vector components found by `standard_name`.
///
/// Eastward (x) and northward (y) components with matching names form a vector, e.g.
/// `eastward_sea_water_velocity` and `northward_sea_water_velocity` form `sea_water_velocity`.
/// Each complete pair gets a `{name}_speed` and a `{name}_direction` variable, the latter in
/// degrees clockwise from north.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualVectorsTransform;

#[derive(Debug, Default)]
struct VectorPair {
    x: Option<String>,
    y: Option<String>,
}

struct Component {
    prefix: &'static str,
    infixes: [&'static str; 2],
    excludes: [&'static str; 2],
}

const X: Component = Component {
    prefix: "eastward_",
    infixes: ["_eastward_", "_x_"],
    excludes: ["_x_edges", "_x_spacing"],
};

const Y: Component = Component {
    prefix: "northward_",
    infixes: ["_northward_", "_y_"],
    excludes: ["_y_edges", "_y_spacing"],
};

impl Component {
    /// Returns the name of the vector that a variable with `standard_name` is a component of.
    fn vector_name(&self, standard_name: &str) -> Option<String> {
        if self.excludes.iter().any(|e| standard_name.contains(e)) {
            return None;
        }
        if let Some(name) = standard_name.strip_prefix(self.prefix) {
            return Some(name.to_owned());
        }
        self.infixes
            .iter()
            .find(|infix| standard_name.contains(*infix))
            .map(|infix| standard_name.replace(infix, "_"))
    }
}

impl Transform for VirtualVectorsTransform {
    fn apply(&self, mut dataset: Dataset, _config: &Value) -> Result<Dataset, TransformError> {
        let mut pairs: IndexMap<String, VectorPair> = IndexMap::new();
        for (name, var) in &dataset.data_vars {
            let Some(standard_name) = var.standard_name() else {
                continue;
            };
            if let Some(vector) = X.vector_name(standard_name) {
                pairs.entry(vector).or_default().x = Some(name.clone());
            }
            if let Some(vector) = Y.vector_name(standard_name) {
                pairs.entry(vector).or_default().y = Some(name.clone());
            }
        }

        for (vector, pair) in pairs {
            let (Some(x_name), Some(y_name)) = (pair.x, pair.y) else {
                continue;
            };
            let (x, y) = (&dataset.data_vars[&x_name], &dataset.data_vars[&y_name]);
            if x.dims != y.dims {
                tracing::warn!(
                    "Discovered vector pair {}/{} have mismatched dims {:?} vs {:?}, skipping",
                    x_name,
                    y_name,
                    x.dims,
                    y.dims
                );
                continue;
            }

            let long_name = vector.replace('_', " ");
            let (speed, direction): (Vec<f64>, Vec<f64>) = x
                .values
                .iter()
                .zip(&y.values)
                .map(|(x, y)| (x.hypot(*y), x.atan2(*y).to_degrees().rem_euclid(360.)))
                .unzip();

            let mut speed = x.map_values(speed);
            speed.attrs.remove("standard_name");
            speed
                .attrs
                .insert("long_name".into(), format!("{long_name} speed").into());

            let mut direction = x.map_values(direction);
            direction.attrs.remove("standard_name");
            direction
                .attrs
                .insert("long_name".into(), format!("{long_name} direction").into());
            direction.attrs.insert("units".into(), "degrees".into());

            dataset.insert_var(format!("{vector}_speed"), speed)?;
            dataset.insert_var(format!("{vector}_direction"), direction)?;
        }

        Ok(dataset)
    }
}
