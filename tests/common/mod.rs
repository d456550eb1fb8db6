//! Shared fixtures: a small synthetic OLCI scene and deterministic fakes of
//! the delegated algorithms.

#![allow(dead_code)]

use std::sync::Arc;

use ndarray::Array2;
use snowpix::core::config::{
    radiance_band_names, reflectance_band_names, ALTITUDE_BAND_NAME, NN_VALUE_BAND_NAME,
    PRESS_13_BAND_NAME, SURFACE_13_BAND_NAME, TRANS_13_BAND_NAME,
};
use snowpix::core::flags::{classification_flag_coding, FlagDefinition, CLASSIF_BAND_NAME};
use snowpix::core::stage::{BoundInputs, ExternalAlgorithm, ParamSet};
use snowpix::core::SnowAlgorithms;
use snowpix::{Band, PixelType, Product, TiePointGrid};

pub const LAND: u32 = 1 << 10;
pub const CLOUD: u32 = 1 << 1;
pub const CLOUD_BUFFER: u32 = 1 << 4;

/// Press_13 value the O2 fake writes when it received a DEM
pub const PRESS_WITH_DEM: f64 = 900.0;
pub const PRESS_WITHOUT_DEM: f64 = 1000.0;

/// Tie-point grids of the synthetic L1b product, (rows, columns) corner values
pub const TIE_POINT_GRIDS: [(&str, [[f64; 2]; 2]); 2] = [
    ("SZA", [[60.0, 62.0], [61.0, 63.0]]),
    ("OZA", [[10.0, 30.0], [12.0, 32.0]]),
];

/// Per-pixel inputs of a synthetic scene (row-major, `height` rows)
#[derive(Debug, Clone)]
pub struct Scene {
    pub width: usize,
    pub height: usize,
    pub altitude: Vec<f64>,
    pub flags: Vec<u32>,
    pub oa21_reflectance: Vec<f64>,
    pub surface_13: Vec<f64>,
    pub trans_13: Vec<f64>,
    /// Flags the classification fake declares on its flag band
    pub classification_flags: Vec<FlagDefinition>,
}

impl Scene {
    /// Uniform scene of land pixels that satisfy every cloud-over-snow condition
    pub fn uniform(width: usize, height: usize) -> Self {
        let n = width * height;
        Self {
            width,
            height,
            altitude: vec![0.0; n],
            flags: vec![LAND; n],
            oa21_reflectance: vec![0.6; n],
            surface_13: vec![0.40; n],
            trans_13: vec![0.395; n],
            classification_flags: classification_flag_coding().flags().to_vec(),
        }
    }

    fn raster(&self, values: &[f64]) -> Array2<f64> {
        Array2::from_shape_vec((self.height, self.width), values.to_vec())
            .expect("scene vectors must match the scene size")
    }

    fn filled(&self, value: f64) -> Array2<f64> {
        Array2::from_elem((self.height, self.width), value)
    }

    /// L1b product with all radiance bands and altitude
    pub fn l1b(&self) -> Product {
        let mut product = Product::new("S3A_OL_1_EFR____TEST", "OL_1_EFR", self.width, self.height);
        for (i, name) in radiance_band_names().into_iter().enumerate() {
            product
                .add_band(Band::stored(name, PixelType::Float32, self.filled(40.0 + i as f64)))
                .expect("radiance band");
        }
        product
            .add_band(
                Band::stored(ALTITUDE_BAND_NAME, PixelType::Float32, self.raster(&self.altitude))
                    .with_unit("m"),
            )
            .expect("altitude band");
        for (name, corners) in TIE_POINT_GRIDS {
            let data = Array2::from_shape_fn((2, 2), |(j, i)| corners[j][i]);
            let grid = TiePointGrid::new(name, (0.5, 0.5), (64.0, 64.0), data)
                .expect("tie-point grid")
                .with_unit("deg");
            product.add_tie_point_grid(grid).expect("tie-point grid");
        }
        product
    }

    pub fn l1b_without(&self, band: &str) -> Product {
        let mut product = self.l1b();
        product.remove_band(band);
        product
    }

    pub fn dem(&self, band_name: &str) -> Product {
        let mut product = Product::new("DEM", "DEM", self.width, self.height);
        product
            .add_band(Band::stored(band_name, PixelType::Float32, self.raster(&self.altitude)))
            .expect("dem band");
        product
    }

    pub fn algorithms(&self) -> SnowAlgorithms {
        let scene = Arc::new(self.clone());
        SnowAlgorithms {
            reflectance: reflectance_fake(Arc::clone(&scene)),
            o2_correction: o2_fake(Arc::clone(&scene)),
            classification: classification_fake(scene),
        }
    }
}

pub fn algorithm<F>(f: F) -> Arc<dyn ExternalAlgorithm>
where
    F: Fn(&BoundInputs<'_>, &ParamSet) -> anyhow::Result<Product> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn reflectance_fake(scene: Arc<Scene>) -> Arc<dyn ExternalAlgorithm> {
    algorithm(move |inputs, params| {
        let source = inputs.required("source")?;
        anyhow::ensure!(params.text("sensor")? == "OLCI", "unsupported sensor");
        let mut product = Product::new("rad2refl", "RHO_TOA", source.width(), source.height());
        for name in reflectance_band_names() {
            let data = if name == "Oa21_reflectance" {
                scene.raster(&scene.oa21_reflectance)
            } else {
                scene.filled(0.1)
            };
            product.add_band(Band::stored(name, PixelType::Float32, data))?;
        }
        Ok(product)
    })
}

fn o2_fake(scene: Arc<Scene>) -> Arc<dyn ExternalAlgorithm> {
    algorithm(move |inputs, params| {
        let l1b = inputs.required("l1b")?;
        let press = match (inputs.get("dem"), params.get("dem_altitude_band_name")) {
            (Some(dem), Some(_)) => {
                let band = params.text("dem_altitude_band_name")?;
                anyhow::ensure!(dem.contains_band(band), "DEM band '{}' missing", band);
                PRESS_WITH_DEM
            }
            (None, None) => PRESS_WITHOUT_DEM,
            _ => anyhow::bail!("DEM product and DEM band name must come together"),
        };
        let mut product = Product::new("o2corr", "O2CORR", l1b.width(), l1b.height());
        product.add_band(Band::stored(
            TRANS_13_BAND_NAME,
            PixelType::Float32,
            scene.raster(&scene.trans_13),
        ))?;
        product.add_band(Band::stored(PRESS_13_BAND_NAME, PixelType::Float32, scene.filled(press)))?;
        product.add_band(Band::stored(
            SURFACE_13_BAND_NAME,
            PixelType::Float32,
            scene.raster(&scene.surface_13),
        ))?;
        Ok(product)
    })
}

fn classification_fake(scene: Arc<Scene>) -> Arc<dyn ExternalAlgorithm> {
    algorithm(move |inputs, params| {
        let l1b = inputs.required("l1b")?;
        let rhotoa = inputs.required("rhotoa")?;
        anyhow::ensure!(rhotoa.contains_band("Oa21_reflectance"), "no reflectances");

        let mut product = Product::new("classification", "IDEPIX", l1b.width(), l1b.height());
        if params.bool("copy_all_tie_points")? {
            for grid in l1b.tie_point_grids() {
                product.add_tie_point_grid(grid.clone())?;
            }
        }
        let flags = scene.flags.iter().map(|&f| f as f64).collect::<Vec<_>>();
        product.add_band(Band::stored(CLASSIF_BAND_NAME, PixelType::UInt32, scene.raster(&flags)))?;
        for flag in &scene.classification_flags {
            product.flag_codings.register(CLASSIF_BAND_NAME, flag.clone())?;
        }
        if params.bool("output_nn_value")? {
            product.add_band(Band::stored(NN_VALUE_BAND_NAME, PixelType::Float32, scene.filled(2.5)))?;
        }
        product.start_time = l1b.start_time;
        product.end_time = l1b.end_time;
        Ok(product)
    })
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
