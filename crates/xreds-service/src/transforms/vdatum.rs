use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::dataset::{Dataset, SchemaError};
use crate::loader::FormatLoader;
use crate::registry::DatasetSpec;

use super::{Transform, TransformError};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct VdatumConfig {
    path: Option<String>,
    water_level_var: String,
    vdatum_var: Option<String>,
    vdatum_name: Option<String>,
    multiplier: f64,
}

impl Default for VdatumConfig {
    fn default() -> Self {
        Self {
            path: None,
            water_level_var: "zeta".into(),
            vdatum_var: None,
            vdatum_name: None,
            multiplier: 1.0,
        }
    }
}

/// Adds the water level relative to a vertical datum.
///
/// The datum grid is read from a separate dataset at `path`. Its dimensions are matched onto the
/// trailing dimensions of the water level variable, and broadcast over the leading ones. The
/// result is stored as `{water_level_var}_{vdatum_name}`.
pub struct VdatumTransform {
    loader: Arc<FormatLoader>,
}

impl VdatumTransform {
    pub fn new(loader: Arc<FormatLoader>) -> Self {
        Self { loader }
    }
}

impl Transform for VdatumTransform {
    fn apply(&self, mut dataset: Dataset, config: &Value) -> Result<Dataset, TransformError> {
        let config = match config {
            Value::Null => VdatumConfig::default(),
            config => VdatumConfig::deserialize(config)?,
        };
        let name = dataset.display_name().to_owned();

        let Some(water_level) = dataset.variable(&config.water_level_var) else {
            tracing::warn!(
                "Dataset {} does not have a {} variable. Skipping vdatum transformation",
                name,
                config.water_level_var
            );
            return Ok(dataset);
        };
        let Some(path) = config.path else {
            tracing::warn!(
                "Dataset {} does not have a vdatum path. Skipping vdatum transformation",
                name
            );
            return Ok(dataset);
        };
        let (Some(datum_var), Some(datum_name)) = (config.vdatum_var, config.vdatum_name) else {
            tracing::warn!(
                "Dataset {} does not have a vdatum_var or vdatum_name. Skipping vdatum transformation",
                name
            );
            return Ok(dataset);
        };

        let datum_dataset = match self.loader.open(&DatasetSpec::from_path(&path)) {
            Ok(datum_dataset) => datum_dataset,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Could not load vdatum dataset from {}. Skipping vdatum transformation",
                    path
                );
                return Ok(dataset);
            }
        };
        let datum = datum_dataset
            .variable(&datum_var)
            .ok_or_else(|| SchemaError::UnknownVariable(datum_var.clone()))?;

        // match the datum dimensions positionally onto the trailing water level dimensions
        let Some(leading) = water_level.dims.len().checked_sub(datum.dims.len()) else {
            return Err(TransformError::Failed(format!(
                "{datum_var} has more dimensions than {}",
                config.water_level_var
            )));
        };
        if water_level.shape[leading..] != datum.shape[..] {
            return Err(TransformError::Failed(format!(
                "shape of {datum_var} {:?} does not match {} {:?}",
                datum.shape, config.water_level_var, water_level.shape
            )));
        }

        let inner = datum.len().max(1);
        let values = water_level
            .values
            .iter()
            .enumerate()
            .map(|(i, level)| level + config.multiplier * datum.values[i % inner])
            .collect();
        let out = water_level
            .map_values(values)
            .with_attr("datum", datum_name.clone());

        let out_name = format!("{}_{datum_name}", config.water_level_var);
        dataset.insert_var(out_name, out)?;
        Ok(dataset)
    }
}
