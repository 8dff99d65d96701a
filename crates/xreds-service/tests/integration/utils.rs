use std::fs;
use std::path::{Path, PathBuf};

use xreds_service::caching::LoadCoordinator;
use xreds_service::config::Config;
use xreds_service::services::create_service;
use xreds_test::{ZarrArray, ZarrFixture};

/// Writes a dataset mapping next to the fixtures in `dir`.
///
/// `{root}` in `yaml` is replaced with the path of `dir`.
pub fn write_mapping(dir: &Path, yaml: &str) -> PathBuf {
    let mapping = dir.join("datasets.yaml");
    let yaml = yaml.replace("{root}", &dir.display().to_string());
    fs::write(&mapping, yaml).unwrap();
    mapping
}

/// Creates the service for the dataset mapping at `mapping`, with otherwise default config.
pub fn service(mapping: PathBuf) -> LoadCoordinator {
    let config = Config {
        datasets_mapping_file: Some(mapping),
        ..Default::default()
    };
    create_service(&config, tokio::runtime::Handle::current()).unwrap()
}

/// An unstructured ocean model output with surface currents and water level on 3 nodes.
pub fn ocean_model() -> ZarrFixture {
    ZarrFixture::new()
        .attr("title", "Gulf of Maine model")
        .array(ZarrArray::new("time", &["time"], &[2], vec![0., 3600.]))
        .array(
            ZarrArray::new("u", &["time", "node"], &[2, 3], vec![3., 0., -1., 0., 0., 0.])
                .attr("standard_name", "eastward_sea_water_velocity")
                .attr("units", "m s-1"),
        )
        .array(
            ZarrArray::new("v", &["time", "node"], &[2, 3], vec![4., 1., 0., 0., 0., 0.])
                .attr("standard_name", "northward_sea_water_velocity")
                .attr("units", "m s-1"),
        )
        .array(
            ZarrArray::new(
                "zeta",
                &["time", "node"],
                &[2, 3],
                vec![0.5, 1.0, 1.5, 2.0, 2.5, 3.0],
            )
            .chunks(&[1, 2])
            .attr("standard_name", "sea_surface_height_above_geoid"),
        )
        .array(ZarrArray::new("h", &["node"], &[3], vec![10., 20., 30.]))
}

pub fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} != {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-9, "{actual:?} != {expected:?}");
    }
}
