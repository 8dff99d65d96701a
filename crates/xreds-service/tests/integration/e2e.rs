use std::sync::Arc;

use xreds_service::caching::DatasetError;
use xreds_service::loader::LoadError;
use xreds_test::{Compression, ZarrArray, ZarrFixture};

use crate::{assert_close, ocean_model, service, write_mapping};

#[tokio::test]
async fn test_zarr_with_transforms() {
    xreds_test::setup();
    let dir = xreds_test::tempdir();
    ocean_model()
        .consolidated(true)
        .compression(Compression::Zlib)
        .write(&dir.path().join("gom.zarr"));
    ZarrFixture::new()
        .array(ZarrArray::new("mllw", &["node"], &[3], vec![-0.5, -1.0, 0.25]))
        .write(&dir.path().join("vdatum.zarr"));

    let mapping = write_mapping(
        dir.path(),
        r#"
gom:
  path: "{root}/gom.zarr"
  drop_variables: h
  additional_attrs:
    name: Gulf of Maine
  extensions:
    virtual_vectors: {}
    vdatum:
      path: "{root}/vdatum.zarr"
      vdatum_var: mllw
      vdatum_name: mllw
"#,
    );
    let service = service(mapping);
    let ds = service.get_dataset("gom").await.unwrap();

    assert_eq!(ds.display_name(), "Gulf of Maine");
    assert_eq!(ds.attrs["title"], "Gulf of Maine model");
    assert!(ds.is_coord("time"));
    assert!(!ds.contains("h"));

    let speed = &ds.data_vars["sea_water_velocity_speed"];
    assert_close(&speed.values, &[5., 1., 1., 0., 0., 0.]);
    assert_eq!(speed.attr_str("long_name"), Some("sea water velocity speed"));
    let direction = &ds.data_vars["sea_water_velocity_direction"];
    assert_close(
        &direction.values[..3],
        &[3f64.atan2(4.).to_degrees(), 0., 270.],
    );
    assert_eq!(direction.attr_str("units"), Some("degrees"));

    let zeta_mllw = &ds.data_vars["zeta_mllw"];
    assert_close(&zeta_mllw.values, &[0., 0., 1.75, 1.5, 1.5, 3.25]);
    assert_eq!(zeta_mllw.attr_str("datum"), Some("mllw"));

    // served from memory from now on
    let again = service.get_dataset("gom").await.unwrap();
    assert!(Arc::ptr_eq(&ds, &again));
}

#[tokio::test]
async fn test_kerchunk_with_global_longitude() {
    xreds_test::setup();
    let dir = xreds_test::tempdir();
    ZarrFixture::new()
        .array(ZarrArray::new("latitude", &["latitude"], &[2], vec![10., 20.]))
        .array(ZarrArray::new(
            "longitude",
            &["longitude"],
            &[4],
            vec![0., 90., 180., 270.],
        ))
        .array(
            ZarrArray::new(
                "t2m",
                &["latitude", "longitude"],
                &[2, 4],
                vec![1., 2., 3., 4., 5., 6., 7., 8.],
            )
            .dtype("<f4"),
        )
        .compression(Compression::Zstd)
        .write_kerchunk(&dir.path().join("gfs.json"), "gfs.bin");

    let mapping = write_mapping(dir.path(), "gfs:\n  path: \"{root}/gfs.json\"\n");
    let ds = service(mapping).get_dataset("gfs").await.unwrap();

    assert_eq!(ds.coords["longitude"].values, vec![-180., -90., 0., 90.]);
    assert_eq!(
        ds.data_vars["t2m"].values,
        vec![3., 4., 1., 2., 7., 8., 5., 6.]
    );
}

#[tokio::test]
async fn test_load_errors() {
    xreds_test::setup();
    let dir = xreds_test::tempdir();
    let mapping = write_mapping(
        dir.path(),
        r#"
missing:
  path: "{root}/missing.zarr"
grib:
  path: "{root}/gfs.grib2"
remote:
  path: s3://noaa-gfs/gfs.zarr
"#,
    );
    let service = service(mapping);

    assert!(matches!(
        service.get_dataset("nope").await,
        Err(DatasetError::NotFound(id)) if id == "nope"
    ));
    assert!(matches!(
        service.get_dataset("missing").await,
        Err(DatasetError::Load { id, .. }) if id == "missing"
    ));
    assert!(matches!(
        service.get_dataset("grib").await,
        Err(DatasetError::Load {
            source: LoadError::UnsupportedFormat(_),
            ..
        })
    ));
    assert!(matches!(
        service.get_dataset("remote").await,
        Err(DatasetError::Load {
            source: LoadError::Unsupported(_),
            ..
        })
    ));

    // nothing is cached for failed loads
    let info = service.cache_info("missing").await.unwrap();
    assert!(info.entry.is_none());
    assert!(!info.loading);
}
