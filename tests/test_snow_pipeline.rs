mod common;

use approx::assert_relative_eq;
use common::{init_logging, Scene, CLOUD, CLOUD_BUFFER, LAND, PRESS_WITHOUT_DEM, PRESS_WITH_DEM};
use snowpix::core::flags::{FlagDefinition, CLASSIF_BAND_NAME, IDEPIX_LAND};
use snowpix::core::graph::StageState;
use snowpix::core::snow_pipeline::{CLOUD_OVER_SNOW_BAND_NAME, SURFACE_PRESSURE_BAND_NAME};
use snowpix::{SnowError, SnowPipeline, SnowPipelineConfig, TiePointGrid};

fn run(scene: &Scene, config: SnowPipelineConfig) -> snowpix::core::PipelineRun {
    SnowPipeline::build(config, &scene.algorithms(), scene.l1b(), None)
        .expect("Failed to build pipeline")
        .run()
        .expect("Pipeline run failed")
}

fn build_error(scene: &Scene, config: SnowPipelineConfig) -> SnowError {
    match SnowPipeline::build(config, &scene.algorithms(), scene.l1b(), None) {
        Ok(_) => panic!("pipeline construction should have failed"),
        Err(e) => e,
    }
}

fn no_o2() -> SnowPipelineConfig {
    SnowPipelineConfig {
        apply_o2_corrected_transmission: false,
        ..SnowPipelineConfig::default()
    }
}

#[test]
fn test_default_pipeline_product_layout() {
    init_logging();
    let scene = Scene::uniform(3, 2);
    let run = run(&scene, SnowPipelineConfig::default());
    let product = &run.product;

    assert_eq!(product.name, "S3A_OL_1_EFR____TEST_IDEPIX");
    assert_eq!(product.product_type, "IDEPIX");
    assert_eq!(product.raster_size(), (3, 2));
    assert_eq!(
        product.band_names(),
        vec![
            "pixel_classif_flags",
            "Oa21_reflectance",
            "trans_13",
            "press_13",
            "surface_13",
            "altitude",
            "surface_pressure",
            "cloud_over_snow",
        ]
    );
    assert_eq!(product.auto_grouping.as_deref(), Some("Oa*_radiance:Oa*_reflectance"));
    assert_eq!(run.order, vec!["rad2refl", "o2corr", "classification", "postprocess"]);
    for (_, state) in &run.stage_states {
        assert_eq!(*state, StageState::Done);
    }

    let surface_pressure = product.band(SURFACE_PRESSURE_BAND_NAME).unwrap();
    assert!(surface_pressure.is_virtual());
    assert_eq!(surface_pressure.unit.as_deref(), Some("hPa"));
    assert_eq!(surface_pressure.no_data_value, 0.0);
    assert!(surface_pressure.no_data_used);
    assert_eq!(
        surface_pressure.expression_text(),
        Some("(1013.25 * exp(-altitude/8400))")
    );

    let cloud_over_snow = product.band(CLOUD_OVER_SNOW_BAND_NAME).unwrap();
    assert_eq!(cloud_over_snow.unit.as_deref(), Some("dl"));
    assert_eq!(
        cloud_over_snow.description.as_deref(),
        Some("Pixel identified as likely cloud over a snow/ice surface")
    );
}

#[test]
fn test_surface_pressure_values() {
    let mut scene = Scene::uniform(2, 1);
    scene.altitude = vec![0.0, 8400.0 * std::f64::consts::LN_2];
    let run = run(&scene, SnowPipelineConfig::default());
    let band = run.product.band(SURFACE_PRESSURE_BAND_NAME).unwrap();

    assert_relative_eq!(band.raw_sample(0, 0), 1013.25, epsilon = 1e-3);
    assert_relative_eq!(band.raw_sample(1, 0), 506.625, epsilon = 1e-2);
}

#[test]
fn test_cloud_over_snow_scenario() {
    let mut scene = Scene::uniform(2, 1);
    scene.oa21_reflectance = vec![0.6, 0.3];
    let run = run(&scene, SnowPipelineConfig::default());
    let band = run.product.band(CLOUD_OVER_SNOW_BAND_NAME).unwrap();

    assert_eq!(band.raw_sample(0, 0), 1.0);
    assert_eq!(band.raw_sample(1, 0), 0.0);
}

#[test]
fn test_cloud_over_snow_reflectance_boundary() {
    let mut scene = Scene::uniform(3, 1);
    scene.oa21_reflectance = vec![0.5, 0.5001, 0.4999];
    let run = run(&scene, SnowPipelineConfig::default());
    let values = run.product.band(CLOUD_OVER_SNOW_BAND_NAME).unwrap().materialize();

    assert_eq!(values[[0, 0]], 0.0);
    assert_eq!(values[[0, 1]], 1.0);
    assert_eq!(values[[0, 2]], 0.0);
}

#[test]
fn test_cloud_over_snow_each_condition() {
    let mut scene = Scene::uniform(3, 1);
    // pixel 1 is not land, pixel 2 has too large a transmission gap
    scene.flags = vec![LAND, 0, LAND];
    scene.surface_13 = vec![0.40, 0.40, 0.42];
    let run = run(&scene, SnowPipelineConfig::default());
    let values = run.product.band(CLOUD_OVER_SNOW_BAND_NAME).unwrap().materialize();

    assert_eq!(values[[0, 0]], 1.0);
    assert_eq!(values[[0, 1]], 0.0);
    assert_eq!(values[[0, 2]], 0.0);
}

#[test]
fn test_cloud_over_snow_no_data_propagation() {
    let mut scene = Scene::uniform(2, 1);
    scene.oa21_reflectance = vec![f64::NAN, 0.6];
    let run = run(&scene, SnowPipelineConfig::default());
    let band = run.product.band(CLOUD_OVER_SNOW_BAND_NAME).unwrap();

    assert_eq!(band.raw_sample(0, 0), 0.0);
    assert_eq!(band.sample(0, 0), None);
    assert_eq!(band.sample(1, 0), Some(1.0));
}

#[test]
fn test_disabling_o2_correction_removes_its_bands() {
    let scene = Scene::uniform(2, 2);
    let with_o2 = run(&scene, SnowPipelineConfig::default());
    let without_o2 = run(&scene, no_o2());

    for name in ["trans_13", "press_13", "surface_13", "cloud_over_snow", "surface_pressure"] {
        assert!(with_o2.product.contains_band(name), "{} expected", name);
        assert!(!without_o2.product.contains_band(name), "{} not expected", name);
    }
    assert_eq!(
        without_o2.product.band_names(),
        vec!["pixel_classif_flags", "Oa21_reflectance"]
    );
    assert_eq!(without_o2.stage_state("o2corr"), Some(StageState::Skipped));
    assert_eq!(without_o2.order, vec!["rad2refl", "classification", "postprocess"]);

    let a = with_o2.product.band("Oa21_reflectance").unwrap().materialize();
    let b = without_o2.product.band("Oa21_reflectance").unwrap().materialize();
    assert_eq!(a, b);
}

#[test]
fn test_o2_disabled_does_not_need_altitude() {
    let scene = Scene::uniform(2, 2);
    let source = scene.l1b_without("altitude");
    let run = SnowPipeline::build(no_o2(), &scene.algorithms(), source, None)
        .expect("altitude is only needed for O2 correction")
        .run()
        .expect("Pipeline run failed");
    assert!(!run.product.contains_band("altitude"));

    let err = SnowPipeline::build(
        SnowPipelineConfig::default(),
        &scene.algorithms(),
        scene.l1b_without("altitude"),
        None,
    )
    .err()
    .expect("altitude is required with O2 correction");
    assert!(matches!(err, SnowError::InputValidation(ref m) if m.contains("altitude")));
}

#[test]
fn test_runs_are_bit_identical() {
    let mut scene = Scene::uniform(4, 3);
    scene.altitude = (0..12).map(|i| i as f64 * 250.0).collect();
    scene.oa21_reflectance = (0..12).map(|i| 0.3 + i as f64 * 0.04).collect();
    scene.flags[5] = CLOUD | LAND;

    let first = run(&scene, SnowPipelineConfig::default());
    let second = run(&scene, SnowPipelineConfig::default());

    assert_eq!(first.product.band_names(), second.product.band_names());
    for band in first.product.bands() {
        let a = band.materialize();
        let b = second.product.band(&band.name).unwrap().materialize();
        let a_bits: Vec<u64> = a.iter().map(|v| v.to_bits()).collect();
        let b_bits: Vec<u64> = b.iter().map(|v| v.to_bits()).collect();
        assert_eq!(a_bits, b_bits, "band {} differs between runs", band.name);
    }
}

#[test]
fn test_missing_radiance_band_fails_before_any_stage() {
    let scene = Scene::uniform(2, 2);
    let err = SnowPipeline::build(
        SnowPipelineConfig::default(),
        &scene.algorithms(),
        scene.l1b_without("Oa07_radiance"),
        None,
    )
    .err()
    .expect("incomplete L1b product must be rejected");
    assert!(matches!(err, SnowError::InputValidation(ref m) if m.contains("Oa07_radiance")));
}

#[test]
fn test_dem_product_is_passed_to_o2_correction() {
    let scene = Scene::uniform(2, 2);
    let config = SnowPipelineConfig {
        dem_band_name: "elevation".to_string(),
        ..SnowPipelineConfig::default()
    };
    let run = SnowPipeline::build(config, &scene.algorithms(), scene.l1b(), Some(scene.dem("elevation")))
        .expect("Failed to build pipeline")
        .run()
        .expect("Pipeline run failed");
    assert_eq!(run.product.band("press_13").unwrap().raw_sample(0, 0), PRESS_WITH_DEM);

    let without = run_default(&scene);
    assert_eq!(without.product.band("press_13").unwrap().raw_sample(0, 0), PRESS_WITHOUT_DEM);
}

fn run_default(scene: &Scene) -> snowpix::core::PipelineRun {
    run(scene, SnowPipelineConfig::default())
}

#[test]
fn test_invalid_dem_product() {
    let scene = Scene::uniform(2, 2);

    let err = SnowPipeline::build(
        SnowPipelineConfig::default(),
        &scene.algorithms(),
        scene.l1b(),
        Some(scene.dem("elevation")),
    )
    .err()
    .expect("DEM without the configured band must be rejected");
    assert!(matches!(err, SnowError::InputValidation(ref m) if m.contains("band_1")));

    let small = Scene::uniform(1, 1);
    let err = SnowPipeline::build(
        SnowPipelineConfig::default(),
        &scene.algorithms(),
        scene.l1b(),
        Some(small.dem("band_1")),
    )
    .err()
    .expect("DEM of another size must be rejected");
    assert!(matches!(err, SnowError::InputValidation(_)));
}

#[test]
fn test_dem_ignored_when_o2_disabled() {
    let scene = Scene::uniform(2, 2);
    let small = Scene::uniform(1, 1);
    let run = SnowPipeline::build(no_o2(), &scene.algorithms(), scene.l1b(), Some(small.dem("x")))
        .expect("DEM is ignored without O2 correction")
        .run()
        .expect("Pipeline run failed");
    assert!(!run.product.contains_band("press_13"));
}

#[test]
fn test_band_selection_and_nn_value() {
    let scene = Scene::uniform(2, 2);
    let config = SnowPipelineConfig {
        radiance_bands_to_copy: vec!["Oa01_radiance".into(), "Oa17_radiance".into()],
        reflectance_bands_to_copy: vec!["Oa17_reflectance".into(), "Oa21_reflectance".into()],
        output_nn_value: true,
        ..SnowPipelineConfig::default()
    };
    let run = run(&scene, config);
    let names = run.product.band_names();
    assert_eq!(
        &names[..6],
        &[
            "pixel_classif_flags",
            "Oa01_radiance",
            "Oa17_radiance",
            "Oa17_reflectance",
            "Oa21_reflectance",
            "nn_value",
        ]
    );
    assert_eq!(run.product.band("Oa17_radiance").unwrap().raw_sample(1, 1), 56.0);
    assert_eq!(run.product.band("nn_value").unwrap().raw_sample(0, 0), 2.5);
}

#[test]
fn test_tie_point_grids_carried_to_target() {
    let scene = Scene::uniform(3, 2);
    let run = run_default(&scene);
    let grids = run.product.tie_point_grids();
    let names: Vec<&str> = grids.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, vec!["SZA", "OZA"]);

    let l1b = scene.l1b();
    for grid in grids {
        assert_eq!(Some(grid), l1b.tie_point_grid(&grid.name));
        assert_eq!(grid.unit.as_deref(), Some("deg"));
        assert!(!run.product.contains_band(&grid.name));
    }
    let sza = run.product.tie_point_grid("SZA").expect("SZA grid");
    assert_relative_eq!(sza.pixel_value(0, 0), 60.0);
    assert_relative_eq!(sza.pixel_value(2, 1), 60.0 + 4.0 / 64.0 + 1.0 / 64.0, epsilon = 1e-12);
}

#[test]
fn test_tie_point_grid_interpolation() {
    let data = ndarray::array![[0.0, 2.0], [4.0, 6.0]];
    let grid = TiePointGrid::new("g", (0.5, 0.5), (2.0, 2.0), data).expect("grid");
    assert_eq!(grid.grid_size(), (2, 2));
    assert_relative_eq!(grid.pixel_value(0, 0), 0.0);
    assert_relative_eq!(grid.pixel_value(1, 0), 1.0);
    assert_relative_eq!(grid.pixel_value(1, 1), 3.0);
    assert_relative_eq!(grid.pixel_value(2, 2), 6.0);
    // clamped beyond the last tie point
    assert_relative_eq!(grid.pixel_value(9, 9), 6.0);

    let err = TiePointGrid::new("flat", (0.5, 0.5), (2.0, 2.0), ndarray::Array2::zeros((1, 4)))
        .unwrap_err();
    assert!(matches!(err, SnowError::Definition(ref m) if m.contains("flat")));
    let err = TiePointGrid::new("g", (0.5, 0.5), (0.0, 2.0), ndarray::Array2::zeros((2, 2)))
        .unwrap_err();
    assert!(matches!(err, SnowError::Definition(_)));
}

#[test]
fn test_dropping_band_21_breaks_cloud_over_snow_at_construction() {
    let scene = Scene::uniform(2, 2);
    let config = SnowPipelineConfig {
        reflectance_bands_to_copy: vec![],
        ..SnowPipelineConfig::default()
    };
    let err = build_error(&scene, config);
    assert!(
        matches!(err, SnowError::Definition(ref m) if m.contains("cloud_over_snow") && m.contains("Oa21_reflectance"))
    );
}

#[test]
fn test_cloud_buffer_in_final_product() {
    let mut scene = Scene::uniform(5, 1);
    scene.flags = vec![CLOUD | LAND, LAND, LAND, LAND, LAND];

    let buffered = run(&scene, SnowPipelineConfig::default());
    let flags = buffered.product.band(CLASSIF_BAND_NAME).unwrap().materialize();
    let flags: Vec<u32> = flags.iter().map(|&v| v as u32).collect();
    assert_eq!(
        flags,
        vec![CLOUD | LAND, LAND | CLOUD_BUFFER, LAND | CLOUD_BUFFER, LAND, LAND]
    );

    let config = SnowPipelineConfig {
        compute_cloud_buffer: false,
        ..SnowPipelineConfig::default()
    };
    let unbuffered = run(&scene, config);
    assert_eq!(unbuffered.stage_state("postprocess"), Some(StageState::Skipped));
    let flags = unbuffered.product.band(CLASSIF_BAND_NAME).unwrap().materialize();
    assert!(flags.iter().all(|&v| (v as u32) & CLOUD_BUFFER == 0));
}

#[test]
fn test_classification_masks_and_codings() {
    let mut scene = Scene::uniform(2, 2);
    scene
        .classification_flags
        .push(
            FlagDefinition::at_bit("IDEPIX_MOUNTAIN_SHADOW", 11, "Mountain shadow")
                .expect("flag bit"),
        );
    let run = run(&scene, SnowPipelineConfig::default());
    let product = &run.product;

    let coding = product.flag_codings.coding(CLASSIF_BAND_NAME).unwrap();
    assert_eq!(coding.flags().len(), 12);
    assert_eq!(coding.mask_of(IDEPIX_LAND), Some(1 << 10));
    assert_eq!(product.masks().len(), 11);
    let land = product.mask(IDEPIX_LAND).unwrap();
    assert_eq!(land.expression, "pixel_classif_flags.IDEPIX_LAND");
    assert_eq!(land.transparency, 0.5);
}

#[test]
fn test_conflicting_classification_coding() {
    let mut scene = Scene::uniform(2, 2);
    scene.classification_flags =
        vec![FlagDefinition::at_bit(IDEPIX_LAND, 12, "misplaced").expect("flag bit")];

    let config = SnowPipelineConfig {
        compute_cloud_buffer: false,
        ..SnowPipelineConfig::default()
    };
    let err = SnowPipeline::build(config, &scene.algorithms(), scene.l1b(), None)
        .expect("Failed to build pipeline")
        .run()
        .unwrap_err();
    assert!(matches!(err, SnowError::Definition(ref m) if m.contains(IDEPIX_LAND)));

    let err = SnowPipeline::build(SnowPipelineConfig::default(), &scene.algorithms(), scene.l1b(), None)
        .expect("Failed to build pipeline")
        .run()
        .unwrap_err();
    assert!(matches!(err, SnowError::Definition(ref m) if m.contains(IDEPIX_LAND)));
}

#[test]
fn test_extra_virtual_bands() {
    let scene = Scene::uniform(2, 2);
    let config: SnowPipelineConfig = serde_json::from_str(
        r#"{
            "extra_virtual_bands": [
                { "name": "pressure_ratio", "expression": "surface_pressure / 1013.25" },
                { "name": "snow_candidate", "expression": "cloud_over_snow || pixel_classif_flags.IDEPIX_SNOW_ICE", "pixel_type": "UInt8" }
            ]
        }"#,
    )
    .expect("valid configuration");
    let run = run(&scene, config);
    let ratio = run.product.band("pressure_ratio").unwrap();
    assert_relative_eq!(ratio.raw_sample(0, 0), 1.0, epsilon = 1e-6);
    let candidate = run.product.band("snow_candidate").unwrap();
    assert_eq!(candidate.raw_sample(1, 1), 1.0);
    assert_eq!(run.product.band_names().last().copied(), Some("snow_candidate"));
}

#[test]
fn test_undefined_flag_in_extra_band() {
    let scene = Scene::uniform(2, 2);
    let mut config = SnowPipelineConfig::default();
    config.extra_virtual_bands = vec![snowpix::core::VirtualBandSpec::new(
        "glacier",
        "pixel_classif_flags.IDEPIX_GLACIER",
    )];
    let err = build_error(&scene, config);
    assert!(matches!(err, SnowError::Definition(ref m) if m.contains("IDEPIX_GLACIER")));
}

#[test]
fn test_classification_failure_aborts_run() {
    let scene = Scene::uniform(2, 2);
    let mut algorithms = scene.algorithms();
    algorithms.classification = common::algorithm(|_, _| anyhow::bail!("network weights not found"));

    let err = SnowPipeline::build(SnowPipelineConfig::default(), &algorithms, scene.l1b(), None)
        .expect("Failed to build pipeline")
        .run()
        .unwrap_err();
    match err {
        SnowError::StageExecution { stage, message } => {
            assert_eq!(stage, "classification");
            assert!(message.contains("network weights"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_classification_output_contract() {
    let scene = Scene::uniform(2, 2);
    let mut algorithms = scene.algorithms();
    algorithms.classification = common::algorithm(|inputs, _| {
        let l1b = inputs.required("l1b")?;
        Ok(snowpix::Product::new("empty", "IDEPIX", l1b.width(), l1b.height()))
    });

    let err = SnowPipeline::build(SnowPipelineConfig::default(), &algorithms, scene.l1b(), None)
        .expect("Failed to build pipeline")
        .run()
        .unwrap_err();
    assert!(
        matches!(err, SnowError::StageExecution { ref stage, ref message } if stage == "classification" && message.contains(CLASSIF_BAND_NAME))
    );
}
