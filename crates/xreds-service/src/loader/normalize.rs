use crate::dataset::{Dataset, SchemaError};
use crate::registry::{Chunks, DatasetSpec};

/// Applies the dataset independent parts of a [`DatasetSpec`] to a freshly opened dataset.
///
/// None of these steps are fatal: failures are logged and the step is skipped.
pub fn normalize(mut dataset: Dataset, spec: &DatasetSpec) -> Dataset {
    for name in &spec.drop_variables {
        dataset.remove(name);
    }

    if let Some(chunks) = &spec.chunks {
        apply_chunks(&mut dataset, chunks);
    }

    dataset.attrs.extend(
        spec.additional_attrs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    if !spec.additional_coords.is_empty() {
        if let Err(err) = dataset.set_coords(&spec.additional_coords) {
            tracing::warn!("Could not set additional coordinates: {}", err);
        }
    }

    if let Err(err) = wrap_longitude(&mut dataset) {
        tracing::warn!("Could not reindex longitude: {}", err);
    }

    for (data_var, mask_var) in &spec.mask_variables {
        if let Err(err) = apply_mask(&mut dataset, mask_var) {
            tracing::warn!(
                "Could not apply requested mask ({}) on ({}): {}",
                mask_var,
                data_var,
                err
            );
        }
    }

    dataset
}

fn apply_chunks(dataset: &mut Dataset, chunks: &Chunks) {
    let Chunks::PerDimension(sizes) = chunks else {
        // named strategies keep the chunking of the source
        return;
    };
    for var in dataset
        .coords
        .values_mut()
        .chain(dataset.data_vars.values_mut())
    {
        let hint: Vec<usize> = var
            .dims
            .iter()
            .zip(&var.shape)
            .enumerate()
            .map(|(axis, (dim, &len))| match sizes.get(dim) {
                Some(&size) if size > 0 => (size as usize).min(len.max(1)),
                Some(_) => len,
                None => var.chunks.as_ref().map_or(len, |chunks| chunks[axis]),
            })
            .collect();
        var.chunks = Some(hint);
    }
}

/// Wraps a `longitude` coordinate on the `longitude` dimension into `[-180, 180)` and sorts the
/// dataset along it.
fn wrap_longitude(dataset: &mut Dataset) -> Result<(), SchemaError> {
    let Some(longitude) = dataset.coords.get_mut("longitude") else {
        return Ok(());
    };
    if longitude.dims != ["longitude"] {
        return Ok(());
    }

    for value in &mut longitude.values {
        *value = (*value + 180.).rem_euclid(360.) - 180.;
    }

    let values = &longitude.values;
    let mut order: Vec<usize> = (0..values.len()).collect();
    // NaN sorts last, like numpy
    order.sort_by(|&a, &b| match (values[a].is_nan(), values[b].is_nan()) {
        (false, false) => values[a].total_cmp(&values[b]),
        (a_nan, b_nan) => a_nan.cmp(&b_nan),
    });
    if order.windows(2).all(|w| w[0] < w[1]) {
        return Ok(());
    }

    tracing::debug!("Sorting dataset along wrapped longitude");
    dataset.take("longitude", &order)
}

/// Keeps the positions where the 1-D `mask_var` is non-zero along its dimension, and drops it.
fn apply_mask(dataset: &mut Dataset, mask_var: &str) -> Result<(), SchemaError> {
    let mask = dataset
        .variable(mask_var)
        .ok_or_else(|| SchemaError::UnknownVariable(mask_var.to_owned()))?;
    let [dim] = mask.dims.as_slice() else {
        return Err(SchemaError::DimensionMismatch {
            variable: mask_var.to_owned(),
            dim: mask.dims.join(","),
            expected: 1,
            found: mask.dims.len(),
        });
    };

    let dim = dim.clone();
    let keep: Vec<usize> = mask
        .values
        .iter()
        .enumerate()
        .filter(|(_, v)| **v != 0. && !v.is_nan())
        .map(|(i, _)| i)
        .collect();

    dataset.take(&dim, &keep)?;
    dataset.remove(mask_var);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::dataset::Variable;

    use super::*;

    fn global_grid() -> Dataset {
        let mut ds = Dataset::new();
        ds.insert_coord(
            "longitude",
            Variable::new(["longitude"], vec![4], vec![0., 90., 180., 270.]),
        )
        .unwrap();
        ds.insert_var(
            "temp",
            Variable::new(["lat", "longitude"], vec![1, 4], vec![1., 2., 3., 4.]),
        )
        .unwrap();
        ds
    }

    #[test]
    fn test_wrap_longitude() {
        let ds = normalize(global_grid(), &DatasetSpec::default());
        assert_eq!(ds.coords["longitude"].values, vec![-180., -90., 0., 90.]);
        assert_eq!(ds.data_vars["temp"].values, vec![3., 4., 1., 2.]);
    }

    #[test]
    fn test_longitude_on_other_dimension_is_untouched() {
        let mut ds = Dataset::new();
        ds.insert_coord(
            "longitude",
            Variable::new(["node"], vec![2], vec![270., 10.]),
        )
        .unwrap();
        let ds = normalize(ds, &DatasetSpec::default());
        assert_eq!(ds.coords["longitude"].values, vec![270., 10.]);
    }

    #[test]
    fn test_mask_variables() {
        let mut ds = Dataset::new();
        ds.insert_var("wet", Variable::new(["node"], vec![4], vec![1., 0., 1., f64::NAN]))
            .unwrap();
        ds.insert_var("zeta", Variable::new(["node"], vec![4], vec![5., 6., 7., 8.]))
            .unwrap();

        let mut spec = DatasetSpec::default();
        spec.mask_variables.insert("zeta".into(), "wet".into());

        let ds = normalize(ds, &spec);
        assert!(!ds.contains("wet"));
        assert_eq!(ds.dims["node"], 2);
        assert_eq!(ds.data_vars["zeta"].values, vec![5., 7.]);
    }

    #[test]
    fn test_failing_steps_are_skipped() {
        let mut spec = DatasetSpec::default();
        spec.additional_coords = vec!["nope".into()];
        spec.mask_variables.insert("temp".into(), "missing".into());
        spec.additional_attrs.insert("title".into(), "Global".into());

        let ds = normalize(global_grid(), &spec);
        assert_eq!(ds.attrs["title"], "Global");
        assert_eq!(ds.data_vars["temp"].values, vec![3., 4., 1., 2.]);
    }

    #[test]
    fn test_drop_and_chunks() {
        let spec: DatasetSpec = serde_yaml::from_str(
            "path: x.zarr\ndrop_variables: temp\nchunks: {longitude: 2}",
        )
        .unwrap();

        let ds = normalize(global_grid(), &spec);
        assert!(!ds.contains("temp"));
        assert_eq!(ds.coords["longitude"].chunks, Some(vec![2]));
    }
}
