use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::api::Poi;
use crate::crawler::task::Task;

/// Attribute of a POI that can be handed to an exporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum OutputField {
    Id,
    Name,
    Type,
    Typecode,
    Address,
    Tel,
    Location,
    Lng,
    Lat,
    ProvinceName,
    ProvinceCode,
    CityName,
    CityCode,
    AdName,
    AdCode,
    Postcode,
    Website,
    Email,
    BizType,
}

impl OutputField {
    pub const DEFAULT: [OutputField; 8] = [
        OutputField::Id,
        OutputField::Name,
        OutputField::Type,
        OutputField::Typecode,
        OutputField::Address,
        OutputField::Tel,
        OutputField::Lng,
        OutputField::Lat,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OutputField::Id => "id",
            OutputField::Name => "name",
            OutputField::Type => "type",
            OutputField::Typecode => "typecode",
            OutputField::Address => "address",
            OutputField::Tel => "tel",
            OutputField::Location => "location",
            OutputField::Lng => "lng",
            OutputField::Lat => "lat",
            OutputField::ProvinceName => "pname",
            OutputField::ProvinceCode => "pcode",
            OutputField::CityName => "cityname",
            OutputField::CityCode => "citycode",
            OutputField::AdName => "adname",
            OutputField::AdCode => "adcode",
            OutputField::Postcode => "postcode",
            OutputField::Website => "website",
            OutputField::Email => "email",
            OutputField::BizType => "biz_type",
        }
    }

    /// Only returned by the service at the `all` detail level
    pub fn requires_all_extension(&self) -> bool {
        matches!(
            self,
            OutputField::Postcode | OutputField::Website | OutputField::Email | OutputField::BizType
        )
    }

    pub fn value(&self, poi: &Poi) -> Option<String> {
        match self {
            OutputField::Id => poi.id.clone(),
            OutputField::Name => poi.name.clone(),
            OutputField::Type => poi.kind.clone(),
            OutputField::Typecode => poi.typecode.clone(),
            OutputField::Address => poi.address.clone(),
            OutputField::Tel => poi.tel.clone(),
            OutputField::Location => poi.location.clone(),
            OutputField::Lng => poi.lng_lat().map(|(lng, _)| lng.to_string()),
            OutputField::Lat => poi.lng_lat().map(|(_, lat)| lat.to_string()),
            OutputField::ProvinceName => poi.province_name.clone(),
            OutputField::ProvinceCode => poi.province_code.clone(),
            OutputField::CityName => poi.city_name.clone(),
            OutputField::CityCode => poi.city_code.clone(),
            OutputField::AdName => poi.ad_name.clone(),
            OutputField::AdCode => poi.ad_code.clone(),
            OutputField::Postcode => poi.postcode.clone(),
            OutputField::Website => poi.website.clone(),
            OutputField::Email => poi.email.clone(),
            OutputField::BizType => poi.biz_type.clone(),
        }
    }
}

/// Collected results as handed to an exporter
#[derive(Debug, Clone, PartialEq)]
pub struct Handover {
    pub pois: Vec<Poi>,
    pub fields: Vec<OutputField>,
}

impl Handover {
    /// Keep POIs inside the task boundary, first occurrence of each id wins
    pub fn build(pois: Vec<Poi>, task: &Task) -> Self {
        let inside = task.filter();
        let mut seen = HashSet::new();

        let pois: Vec<Poi> = pois
            .into_iter()
            .filter(|poi| inside(poi))
            .filter(|poi| match &poi.id {
                Some(id) => seen.insert(id.clone()),
                None => true,
            })
            .collect();

        Self {
            pois,
            fields: task.output_fields.clone(),
        }
    }

    /// One map per POI, keyed by field name
    pub fn rows(&self) -> Vec<Map<String, Value>> {
        self.pois
            .iter()
            .map(|poi| {
                self.fields
                    .iter()
                    .map(|field| {
                        let value = field.value(poi).map(Value::String).unwrap_or(Value::Null);
                        (field.name().to_string(), value)
                    })
                    .collect()
            })
            .collect()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        debug!("Writing {} POIs to {}", self.pois.len(), path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_json::to_string_pretty(&self.rows()).context("Failed to serialize POIs")?;
        fs::write(path, contents).context(format!("Failed to write output file: {}", path.display()))?;

        Ok(())
    }
}
