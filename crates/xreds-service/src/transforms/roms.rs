use serde_json::Value;

use crate::dataset::{Attributes, Dataset, SchemaError, Variable};

use super::{Transform, TransformError};

/// Rotates ROMS surface currents from the staggered model grid to east/north components.
///
/// `u` and `v` live on the u and v points of an Arakawa C grid. Their first time step and surface
/// layer are averaged onto the rho points:
///
/// ```text
/// u_rho(j, i) = 0.5 * (u(j, i - 1) + u(j, i))
/// v_rho(j, i) = 0.5 * (v(j - 1, i) + v(j, i))
/// ```
///
/// with the outermost columns (rows) copied, and then rotated by the grid `angle`:
///
/// ```text
/// u_rotated = u_rho * cos(angle) - v_rho * sin(angle)
/// v_rotated = v_rho * cos(angle) + u_rho * sin(angle)
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct RomsTransform;

/// Selects the first time step and surface layer, if the variable has those dimensions.
fn surface(dataset: &Dataset, name: &str) -> Result<Variable, TransformError> {
    let mut var = dataset
        .variable(name)
        .ok_or_else(|| SchemaError::UnknownVariable(name.to_owned()))?
        .clone();
    for dim in ["ocean_time", "s_rho"] {
        if var.axis(dim).is_some() {
            var = var.isel(dim, 0)?;
        }
    }
    if var.dims.len() != 2 {
        return Err(TransformError::Failed(format!(
            "expected a 2-d surface for {name}, got dimensions {:?}",
            var.dims
        )));
    }
    Ok(var)
}

fn rotated_attrs(component: &Variable, long_name: &str) -> Attributes {
    let mut attrs: Attributes = ["field", "units", "standard_name"]
        .into_iter()
        .filter_map(|key| Some((key.to_owned(), component.attrs.get(key)?.clone())))
        .collect();
    attrs.insert("long_name".into(), long_name.into());
    attrs
}

impl Transform for RomsTransform {
    fn apply(&self, mut dataset: Dataset, _config: &Value) -> Result<Dataset, TransformError> {
        let angle = dataset
            .variable("angle")
            .ok_or_else(|| SchemaError::UnknownVariable("angle".into()))?;
        let [ny, nx] = angle.shape[..] else {
            return Err(TransformError::Failed("angle must be 2-d".into()));
        };

        let u = surface(&dataset, "u")?;
        let v = surface(&dataset, "v")?;
        if nx < 2 || ny < 2 || u.shape != [ny, nx - 1] || v.shape != [ny - 1, nx] {
            return Err(TransformError::Failed(format!(
                "staggered shapes u {:?} and v {:?} do not match rho shape {:?}",
                u.shape, v.shape, angle.shape
            )));
        }

        let mut u_rho = vec![0.; ny * nx];
        let mut v_rho = vec![0.; ny * nx];
        for j in 0..ny {
            for i in 0..nx {
                u_rho[j * nx + i] = if i == 0 {
                    u.values[j * (nx - 1)]
                } else if i == nx - 1 {
                    u.values[j * (nx - 1) + nx - 2]
                } else {
                    0.5 * (u.values[j * (nx - 1) + i - 1] + u.values[j * (nx - 1) + i])
                };
                v_rho[j * nx + i] = if j == 0 {
                    v.values[i]
                } else if j == ny - 1 {
                    v.values[(ny - 2) * nx + i]
                } else {
                    0.5 * (v.values[(j - 1) * nx + i] + v.values[j * nx + i])
                };
            }
        }

        let (u_rotated, v_rotated): (Vec<f64>, Vec<f64>) = angle
            .values
            .iter()
            .zip(u_rho.iter().zip(&v_rho))
            .map(|(angle, (u, v))| {
                let (sin, cos) = angle.sin_cos();
                (u * cos - v * sin, v * cos + u * sin)
            })
            .unzip();

        let mut u_rotated = Variable::new(angle.dims.clone(), angle.shape.clone(), u_rotated);
        u_rotated.attrs = rotated_attrs(&u, "u velocity rotated from ROMS grid");
        let mut v_rotated = Variable::new(angle.dims.clone(), angle.shape.clone(), v_rotated);
        v_rotated.attrs = rotated_attrs(&v, "v velocity rotated from ROMS grid");

        dataset.insert_var("u_rotated", u_rotated)?;
        dataset.insert_var("v_rotated", v_rotated)?;
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::FRAC_PI_2;

    use super::*;

    /// A 2 x 3 rho grid with one time step and two layers.
    fn roms(angle: f64) -> Dataset {
        let mut ds = Dataset::new();
        ds.insert_coord(
            "angle",
            Variable::new(["eta_rho", "xi_rho"], vec![2, 3], vec![angle; 6])
                .with_attr("units", "radians"),
        )
        .unwrap();
        ds.insert_var(
            "u",
            Variable::new(
                ["ocean_time", "s_rho", "eta_u", "xi_u"],
                vec![1, 2, 2, 2],
                vec![1., 3., 5., 7., 0., 0., 0., 0.],
            )
            .with_attr("units", "meter second-1")
            .with_attr("field", "u-velocity, scalar, series")
            .with_attr("long_name", "u-momentum component"),
        )
        .unwrap();
        ds.insert_var(
            "v",
            Variable::new(
                ["ocean_time", "s_rho", "eta_v", "xi_v"],
                vec![1, 2, 1, 3],
                vec![2., 4., 6., 0., 0., 0.],
            )
            .with_attr("units", "meter second-1"),
        )
        .unwrap();
        ds
    }

    #[test]
    fn test_average_onto_rho_grid() {
        let ds = RomsTransform.apply(roms(0.), &Value::Null).unwrap();

        let u = &ds.data_vars["u_rotated"];
        assert_eq!(u.dims, vec!["eta_rho", "xi_rho"]);
        assert_eq!(u.values, vec![1., 2., 3., 5., 6., 7.]);
        assert_eq!(u.attr_str("long_name"), Some("u velocity rotated from ROMS grid"));
        assert_eq!(u.attr_str("units"), Some("meter second-1"));
        assert_eq!(u.attr_str("field"), Some("u-velocity, scalar, series"));

        let v = &ds.data_vars["v_rotated"];
        assert_eq!(v.values, vec![2., 4., 6., 2., 4., 6.]);
        assert_eq!(v.attr_str("long_name"), Some("v velocity rotated from ROMS grid"));
    }

    #[test]
    fn test_rotation() {
        let ds = RomsTransform.apply(roms(FRAC_PI_2), &Value::Null).unwrap();

        // a quarter turn maps grid x onto north and grid y onto west
        let u = &ds.data_vars["u_rotated"].values;
        let v = &ds.data_vars["v_rotated"].values;
        for (actual, expected) in u.iter().zip([-2., -4., -6., -2., -4., -6.]) {
            assert!((actual - expected).abs() < 1e-9);
        }
        for (actual, expected) in v.iter().zip([1., 2., 3., 5., 6., 7.]) {
            assert!((actual - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_missing_variables() {
        let mut ds = roms(0.);
        ds.remove("v");
        assert!(matches!(
            RomsTransform.apply(ds, &Value::Null),
            Err(TransformError::Schema(SchemaError::UnknownVariable(name))) if name == "v"
        ));
    }
}
