//! Flag codings and bitmask bands.
//!
//! A flag coding names individual bits of an integer band. The registry keys
//! codings by the name of their backing band so expressions can test
//! `band.FLAG` and merged products can enumerate every named flag.

use std::collections::BTreeMap;

use ndarray::{Array2, Zip};

use crate::types::{Band, Mask, PixelType, Product, SnowError, SnowResult};

/// Classification flag band produced by the classification stage
pub const CLASSIF_BAND_NAME: &str = "pixel_classif_flags";

pub const IDEPIX_INVALID: &str = "IDEPIX_INVALID";
pub const IDEPIX_CLOUD: &str = "IDEPIX_CLOUD";
pub const IDEPIX_CLOUD_AMBIGUOUS: &str = "IDEPIX_CLOUD_AMBIGUOUS";
pub const IDEPIX_CLOUD_SURE: &str = "IDEPIX_CLOUD_SURE";
pub const IDEPIX_CLOUD_BUFFER: &str = "IDEPIX_CLOUD_BUFFER";
pub const IDEPIX_CLOUD_SHADOW: &str = "IDEPIX_CLOUD_SHADOW";
pub const IDEPIX_SNOW_ICE: &str = "IDEPIX_SNOW_ICE";
pub const IDEPIX_BRIGHT: &str = "IDEPIX_BRIGHT";
pub const IDEPIX_WHITE: &str = "IDEPIX_WHITE";
pub const IDEPIX_COASTLINE: &str = "IDEPIX_COASTLINE";
pub const IDEPIX_LAND: &str = "IDEPIX_LAND";

/// Transparency applied to every classification mask
const MASK_TRANSPARENCY: f64 = 0.5;

/// (name, bit, description, display colour)
const CLASSIFICATION_FLAGS: [(&str, u32, &str, [u8; 3]); 11] = [
    (IDEPIX_INVALID, 0, "Invalid pixels", [255, 0, 0]),
    (IDEPIX_CLOUD, 1, "Pixels which are either cloud_sure or cloud_ambiguous", [255, 0, 255]),
    (IDEPIX_CLOUD_AMBIGUOUS, 2, "Semi transparent clouds, or clouds where the detection level is uncertain", [255, 255, 0]),
    (IDEPIX_CLOUD_SURE, 3, "Fully opaque clouds with full confidence of their detection", [255, 0, 127]),
    (IDEPIX_CLOUD_BUFFER, 4, "A buffer of n pixels around a cloud", [255, 127, 0]),
    (IDEPIX_CLOUD_SHADOW, 5, "Pixels is affected by a cloud shadow", [127, 0, 255]),
    (IDEPIX_SNOW_ICE, 6, "Snow/ice pixels", [0, 255, 255]),
    (IDEPIX_BRIGHT, 7, "Bright pixels", [255, 200, 200]),
    (IDEPIX_WHITE, 8, "White pixels", [230, 230, 230]),
    (IDEPIX_COASTLINE, 9, "Pixels at a coastline", [0, 127, 0]),
    (IDEPIX_LAND, 10, "Land pixels", [0, 200, 0]),
];

/// One named bit (or bit group) of a flag band
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagDefinition {
    pub name: String,
    pub mask: u32,
    pub description: String,
}

impl FlagDefinition {
    pub fn new(name: impl Into<String>, mask: u32, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mask,
            description: description.into(),
        }
    }

    /// Single-bit flag at `bit` (0 = least significant).
    ///
    /// Bits beyond the 32-bit flag word are a `Definition` error.
    pub fn at_bit(
        name: impl Into<String>,
        bit: u32,
        description: impl Into<String>,
    ) -> SnowResult<Self> {
        let name = name.into();
        let mask = 1u32.checked_shl(bit).ok_or_else(|| {
            SnowError::Definition(format!(
                "flag '{}' at bit {} does not fit a 32-bit flag word",
                name, bit
            ))
        })?;
        Ok(Self::new(name, mask, description))
    }
}

/// Named flags of one backing band, bits pairwise disjoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagCoding {
    pub name: String,
    flags: Vec<FlagDefinition>,
}

impl FlagCoding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: Vec::new(),
        }
    }

    /// Add a flag.
    ///
    /// Returns `Ok(false)` when an identical definition is already present.
    pub fn add(&mut self, flag: FlagDefinition) -> SnowResult<bool> {
        if flag.mask == 0 {
            return Err(SnowError::Definition(format!(
                "flag '{}' of coding '{}' has an empty mask",
                flag.name, self.name
            )));
        }
        if let Some(existing) = self.flag(&flag.name) {
            if existing.mask == flag.mask {
                return Ok(false);
            }
            return Err(SnowError::Definition(format!(
                "flag '{}' of coding '{}' redefined with mask {:#x} (was {:#x})",
                flag.name, self.name, flag.mask, existing.mask
            )));
        }
        if let Some(clash) = self.flags.iter().find(|f| f.mask & flag.mask != 0) {
            return Err(SnowError::Definition(format!(
                "flag '{}' (mask {:#x}) overlaps flag '{}' (mask {:#x}) of coding '{}'",
                flag.name, flag.mask, clash.name, clash.mask, self.name
            )));
        }
        self.flags.push(flag);
        Ok(true)
    }

    pub fn flags(&self) -> &[FlagDefinition] {
        &self.flags
    }

    pub fn flag(&self, name: &str) -> Option<&FlagDefinition> {
        self.flags.iter().find(|f| f.name == name)
    }

    pub fn mask_of(&self, name: &str) -> Option<u32> {
        self.flag(name).map(|f| f.mask)
    }
}

/// Flag codings of a product, keyed by backing band name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagRegistry {
    codings: BTreeMap<String, FlagCoding>,
}

impl FlagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flag on `band`, creating its coding on first use
    pub fn register(&mut self, band: &str, flag: FlagDefinition) -> SnowResult<()> {
        let coding = self
            .codings
            .entry(band.to_string())
            .or_insert_with(|| FlagCoding::new(band));
        if !coding.add(flag)? {
            log::debug!("Flag already registered on '{}', keeping existing definition", band);
        }
        Ok(())
    }

    pub fn coding(&self, band: &str) -> Option<&FlagCoding> {
        self.codings.get(band)
    }

    pub fn contains_band(&self, band: &str) -> bool {
        self.codings.contains_key(band)
    }

    pub fn flag_mask(&self, band: &str, flag: &str) -> Option<u32> {
        self.codings.get(band)?.mask_of(flag)
    }

    pub fn bands(&self) -> impl Iterator<Item = &str> {
        self.codings.keys().map(String::as_str)
    }

    /// Every (band, flag) pair known to the registry
    pub fn all_flags(&self) -> Vec<(&str, &FlagDefinition)> {
        self.codings
            .iter()
            .flat_map(|(band, coding)| coding.flags.iter().map(move |f| (band.as_str(), f)))
            .collect()
    }

    /// Compose with another registry.
    ///
    /// Identical definitions merge; a flag redefined with another mask or
    /// overlapping a different flag of the same band is a `Definition` error.
    pub fn compose(&mut self, other: &FlagRegistry) -> SnowResult<()> {
        for (band, coding) in &other.codings {
            for flag in &coding.flags {
                self.register(band, flag.clone())?;
            }
        }
        Ok(())
    }

    /// Compose a single coding under `band`
    pub fn compose_coding(&mut self, band: &str, coding: &FlagCoding) -> SnowResult<()> {
        for flag in &coding.flags {
            self.register(band, flag.clone())?;
        }
        Ok(())
    }

    /// Render the bitmask band of `band` from per-flag boolean predicates.
    ///
    /// Every predicate must name a flag of the band's coding and match the
    /// requested raster size.
    pub fn render(
        &self,
        band: &str,
        width: usize,
        height: usize,
        predicates: &BTreeMap<String, Array2<bool>>,
    ) -> SnowResult<Band> {
        let coding = self.coding(band).ok_or_else(|| {
            SnowError::Definition(format!("no flag coding registered for band '{}'", band))
        })?;

        let mut bits = Array2::<u32>::zeros((height, width));
        for (flag, predicate) in predicates {
            let mask = coding.mask_of(flag).ok_or_else(|| {
                SnowError::Definition(format!("undefined flag '{}.{}'", band, flag))
            })?;
            if predicate.dim() != (height, width) {
                return Err(SnowError::Definition(format!(
                    "predicate for flag '{}.{}' is {:?}, expected {:?}",
                    band,
                    flag,
                    predicate.dim(),
                    (height, width)
                )));
            }
            Zip::from(&mut bits).and(predicate).for_each(|b, &set| {
                if set {
                    *b |= mask;
                }
            });
        }

        Ok(Band::stored(band, PixelType::UInt32, bits.mapv(f64::from)))
    }
}

/// Standard pixel classification flags
pub fn classification_flag_coding() -> FlagCoding {
    let mut coding = FlagCoding::new(CLASSIF_BAND_NAME);
    for (name, bit, description, _) in CLASSIFICATION_FLAGS {
        coding.flags.push(FlagDefinition::new(name, 1 << bit, description));
    }
    coding
}

/// One display mask per classification flag
pub fn classification_masks() -> Vec<Mask> {
    CLASSIFICATION_FLAGS
        .iter()
        .map(|(name, _, description, color)| Mask {
            name: (*name).to_string(),
            expression: format!("{}.{}", CLASSIF_BAND_NAME, name),
            description: (*description).to_string(),
            color: *color,
            transparency: MASK_TRANSPARENCY,
        })
        .collect()
}

/// Attach the classification flag coding and masks to a product.
///
/// The product must already carry the classification flag band.
pub fn setup_classification_bitmask(product: &mut Product) -> SnowResult<()> {
    if !product.contains_band(CLASSIF_BAND_NAME) {
        return Err(SnowError::Definition(format!(
            "product '{}' has no '{}' band",
            product.name, CLASSIF_BAND_NAME
        )));
    }
    product
        .flag_codings
        .compose_coding(CLASSIF_BAND_NAME, &classification_flag_coding())?;
    for mask in classification_masks() {
        product.add_mask(mask)?;
    }
    log::debug!(
        "Classification bitmask set up on '{}' ({} masks)",
        product.name,
        product.masks().len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_bit_rejected_on_same_band() {
        let mut registry = FlagRegistry::new();
        registry.register("flags_a", FlagDefinition::at_bit("A", 3, "a").unwrap()).unwrap();

        let err = registry
            .register("flags_a", FlagDefinition::at_bit("B", 3, "b").unwrap())
            .unwrap_err();
        assert!(matches!(err, SnowError::Definition(ref m) if m.contains("overlaps")));

        registry.register("flags_b", FlagDefinition::at_bit("B", 3, "b").unwrap()).unwrap();
        assert_eq!(registry.flag_mask("flags_b", "B"), Some(8));
    }

    #[test]
    fn test_bit_outside_flag_word_rejected() {
        assert_eq!(FlagDefinition::at_bit("TOP", 31, "").unwrap().mask, 1 << 31);
        for bit in [32, 40, u32::MAX] {
            let err = FlagDefinition::at_bit("OUT", bit, "").unwrap_err();
            assert!(matches!(err, SnowError::Definition(ref m) if m.contains("OUT")));
        }
    }

    #[test]
    fn test_multi_bit_mask_overlap() {
        let mut coding = FlagCoding::new("f");
        coding.add(FlagDefinition::new("LOW", 0b0011, "")).unwrap();
        assert!(coding.add(FlagDefinition::new("MID", 0b0110, "")).is_err());
        assert!(coding.add(FlagDefinition::new("HIGH", 0b1100, "")).unwrap());
        assert!(coding.add(FlagDefinition::new("ZERO", 0, "")).is_err());
    }

    #[test]
    fn test_compose_merges_identical_and_rejects_conflicts() {
        let mut upstream = FlagRegistry::new();
        upstream
            .compose_coding(CLASSIF_BAND_NAME, &classification_flag_coding())
            .unwrap();

        let mut downstream = FlagRegistry::new();
        downstream
            .register(CLASSIF_BAND_NAME, FlagDefinition::at_bit(IDEPIX_LAND, 10, "Land pixels").unwrap())
            .unwrap();
        downstream
            .register(CLASSIF_BAND_NAME, FlagDefinition::at_bit("IDEPIX_MOUNTAIN_SHADOW", 11, "").unwrap())
            .unwrap();

        upstream.compose(&downstream).unwrap();
        assert_eq!(upstream.coding(CLASSIF_BAND_NAME).unwrap().flags().len(), 12);

        let mut conflicting = FlagRegistry::new();
        conflicting
            .register(CLASSIF_BAND_NAME, FlagDefinition::at_bit(IDEPIX_LAND, 12, "").unwrap())
            .unwrap();
        assert!(upstream.compose(&conflicting).is_err());
    }

    #[test]
    fn test_render_bitmask() {
        let mut registry = FlagRegistry::new();
        registry
            .compose_coding(CLASSIF_BAND_NAME, &classification_flag_coding())
            .unwrap();

        let mut predicates = BTreeMap::new();
        predicates.insert(
            IDEPIX_LAND.to_string(),
            Array2::from_shape_vec((1, 2), vec![true, false]).unwrap(),
        );
        predicates.insert(
            IDEPIX_CLOUD.to_string(),
            Array2::from_shape_vec((1, 2), vec![true, true]).unwrap(),
        );

        let band = registry.render(CLASSIF_BAND_NAME, 2, 1, &predicates).unwrap();
        assert_eq!(band.pixel_type, PixelType::UInt32);
        assert_eq!(band.raw_sample(0, 0), ((1 << 10) | (1 << 1)) as f64);
        assert_eq!(band.raw_sample(1, 0), (1 << 1) as f64);

        predicates.insert("UNKNOWN".to_string(), Array2::from_elem((1, 2), true));
        assert!(registry.render(CLASSIF_BAND_NAME, 2, 1, &predicates).is_err());
    }

    #[test]
    fn test_classification_masks_cover_every_flag() {
        let masks = classification_masks();
        let coding = classification_flag_coding();
        assert_eq!(masks.len(), coding.flags().len());
        for mask in &masks {
            assert!(coding.flag(&mask.name).is_some());
            assert_eq!(mask.expression, format!("pixel_classif_flags.{}", mask.name));
            assert_eq!(mask.transparency, 0.5);
        }
    }
}
