use axum::Json;
use axum::extract::{Path, State};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::time::Instant;
use xreds_service::caching::LoadCoordinator;
use xreds_service::dataset::{Attributes, DataType, Dataset, Variable};

use super::ResponseError;

/// The header of a variable, without its values.
#[derive(Debug, Serialize)]
pub struct VariableSummary {
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub dtype: DataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<usize>>,
    pub attrs: Attributes,
}

impl From<&Variable> for VariableSummary {
    fn from(var: &Variable) -> Self {
        Self {
            dims: var.dims.clone(),
            shape: var.shape.clone(),
            dtype: var.dtype,
            chunks: var.chunks.clone(),
            attrs: var.attrs.clone(),
        }
    }
}

/// Describes the structure of a loaded dataset.
#[derive(Debug, Serialize)]
pub struct DatasetSummary {
    pub id: String,
    pub dims: IndexMap<String, usize>,
    pub coords: IndexMap<String, VariableSummary>,
    pub data_vars: IndexMap<String, VariableSummary>,
    pub attrs: Attributes,
}

impl DatasetSummary {
    pub fn new(id: &str, dataset: &Dataset) -> Self {
        let summarize = |vars: &IndexMap<String, Variable>| -> IndexMap<String, VariableSummary> {
            vars.iter()
                .map(|(name, var)| (name.clone(), VariableSummary::from(var)))
                .collect()
        };
        Self {
            id: id.to_owned(),
            dims: dataset.dims.clone(),
            coords: summarize(&dataset.coords),
            data_vars: summarize(&dataset.data_vars),
            attrs: dataset.attrs.clone(),
        }
    }
}

/// The cache state of a dataset in the process that answered the request.
///
/// All ages are in seconds.
#[derive(Debug, Serialize)]
pub struct CacheSummary {
    pub id: String,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_requested: Option<f64>,
    pub loading: bool,
}

pub async fn list_datasets(State(service): State<LoadCoordinator>) -> Json<Vec<String>> {
    Json(service.registry().ids().map(str::to_owned).collect())
}

pub async fn get_dataset(
    State(service): State<LoadCoordinator>,
    Path(id): Path<String>,
) -> Result<Json<DatasetSummary>, ResponseError> {
    let dataset = service.get_dataset(&id).await?;
    Ok(Json(DatasetSummary::new(&id, &dataset)))
}

pub async fn get_cache_info(
    State(service): State<LoadCoordinator>,
    Path(id): Path<String>,
) -> Result<Json<CacheSummary>, ResponseError> {
    let info = service.cache_info(&id).await?;
    let now = Instant::now();
    let entry = info.entry;
    Ok(Json(CacheSummary {
        id,
        cached: entry.is_some_and(|entry| entry.expires_at > now),
        age: entry.map(|entry| now.saturating_duration_since(entry.inserted_at).as_secs_f64()),
        expires_in: entry.map(|entry| entry.expires_at.saturating_duration_since(now).as_secs_f64()),
        last_requested: entry
            .map(|entry| now.saturating_duration_since(entry.last_requested_at).as_secs_f64()),
        loading: info.loading,
    }))
}
