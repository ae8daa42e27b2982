//! Outputs a step body contributes during its run.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::reports::{Link, ReportRecord};

/// One `(category, name, value)` pipeline-environment output.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvEntry {
    pub category: String,
    pub name: String,
    pub value: Value,
}

/// Whether a measurement value is a field or a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MeasurementKind {
    Field,
    Tag,
}

impl MeasurementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Field => "fields",
            Self::Tag => "tags",
        }
    }
}

/// An influx-style data point value.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub measurement: String,
    pub kind: MeasurementKind,
    pub name: String,
    pub value: Value,
}

/// Everything a step body accumulates for the finalizer to persist.
///
/// Setting the same environment key twice keeps the last value.
#[derive(Debug, Default, Clone)]
pub struct StepOutputs {
    env: Vec<EnvEntry>,
    measurements: Vec<Measurement>,
    reports: Vec<ReportRecord>,
    links: Vec<Link>,
    custom_data: BTreeMap<String, String>,
}

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pipeline-environment output.
    pub fn set_env(&mut self, category: impl Into<String>, name: impl Into<String>, value: impl Into<Value>) {
        let category = category.into();
        let name = name.into();
        let value = value.into();
        match self
            .env
            .iter_mut()
            .find(|e| e.category == category && e.name == name)
        {
            Some(existing) => existing.value = value,
            None => self.env.push(EnvEntry {
                category,
                name,
                value,
            }),
        }
    }

    pub fn env(&self) -> &[EnvEntry] {
        &self.env
    }

    pub fn add_field(&mut self, measurement: impl Into<String>, name: impl Into<String>, value: impl Into<Value>) {
        self.push_measurement(measurement.into(), MeasurementKind::Field, name.into(), value.into());
    }

    pub fn add_tag(&mut self, measurement: impl Into<String>, name: impl Into<String>, value: impl Into<String>) {
        self.push_measurement(
            measurement.into(),
            MeasurementKind::Tag,
            name.into(),
            Value::String(value.into()),
        );
    }

    fn push_measurement(&mut self, measurement: String, kind: MeasurementKind, name: String, value: Value) {
        match self
            .measurements
            .iter_mut()
            .find(|m| m.measurement == measurement && m.kind == kind && m.name == name)
        {
            Some(existing) => existing.value = value,
            None => self.measurements.push(Measurement {
                measurement,
                kind,
                name,
                value,
            }),
        }
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn add_report(&mut self, record: ReportRecord) {
        self.reports.push(record);
    }

    pub fn reports(&self) -> &[ReportRecord] {
        &self.reports
    }

    pub fn add_link(&mut self, link: Link) {
        self.links.push(link);
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Free-form telemetry data.
    pub fn set_custom_data(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom_data.insert(key.into(), value.into());
    }

    pub fn custom_data(&self) -> &BTreeMap<String, String> {
        &self.custom_data
    }

    pub fn is_empty(&self) -> bool {
        self.env.is_empty()
            && self.measurements.is_empty()
            && self.reports.is_empty()
            && self.links.is_empty()
            && self.custom_data.is_empty()
    }
}
