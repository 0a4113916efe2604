//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulated OPC-DA server for development without a real source."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::f64::consts::PI;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rand::prelude::*;
use tracing::{debug, info};

use super::TagSession;
use crate::error::SessionError;
use crate::value::{Quality, RawReading, SourceTimestamp, TagValue};

const DEFAULT_SEED: u64 = 0x0DA5_EED;

#[derive(Debug, Clone, Copy)]
enum Generator {
    RandomInt { min: i64, max: i64 },
    RandomReal { min: f64, max: f64 },
    RandomText,
    RandomBool,
    Now,
    RandomIntArray,
    Triangle { period: f64, offset: f64, amplitude: f64 },
    SawTooth { period: f64, scale: f64 },
    Square { period: f64, high: f64, low: f64 },
    SquareBool { period: f64 },
}

fn catalogue() -> HashMap<&'static str, Generator> {
    use Generator::*;
    HashMap::from([
        ("Random.Int1", RandomInt { min: 0, max: 255 }),
        ("Random.Int2", RandomInt { min: -32768, max: 32767 }),
        ("Random.Int4", RandomInt { min: 0, max: 100 }),
        ("Random.Real4", RandomReal { min: 0.0, max: 100.0 }),
        ("Random.Real8", RandomReal { min: 0.0, max: 100.0 }),
        ("Random.String", RandomText),
        ("Random.Boolean", RandomBool),
        ("Random.Time", Now),
        ("Random.ArrayInt2", RandomIntArray),
        ("Bucket.Brigade.Int4", RandomInt { min: 0, max: 10_000 }),
        ("Bucket.Brigade.Real8", RandomReal { min: -50.0, max: 150.0 }),
        ("Bucket.Brigade.Boolean", RandomBool),
        ("Bucket.Brigade.Time", Now),
        ("Triangle Waves.Int4", Triangle { period: 20.0, offset: 50.0, amplitude: 50.0 }),
        ("Triangle Waves.Real8", Triangle { period: 30.0, offset: 50.0, amplitude: 50.0 }),
        ("Saw-toothed Waves.Int4", SawTooth { period: 20.0, scale: 100.0 }),
        ("Saw-toothed Waves.Real8", SawTooth { period: 30.0, scale: 100.0 }),
        ("Square Waves.Boolean", SquareBool { period: 5.0 }),
        ("Square Waves.Int4", Square { period: 20.0, high: 100.0, low: 0.0 }),
    ])
}

/// In-process stand-in for an OPC-DA simulation server.
///
/// Generated tags change on every read; written tags return the written value
/// until the session is closed. Unknown tags read as BAD quality.
#[derive(Debug)]
pub struct SimulatedSession {
    generators: HashMap<&'static str, Generator>,
    written: HashMap<String, TagValue>,
    rng: StdRng,
    connected: Option<(String, String)>,
    started: Option<Instant>,
}

impl Default for SimulatedSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSession {
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// Seed the internal RNG for deterministic testing.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            generators: catalogue(),
            written: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
            connected: None,
            started: None,
        }
    }

    /// Tag paths the simulation serves.
    pub fn tag_paths(&self) -> Vec<&'static str> {
        let mut paths: Vec<_> = self.generators.keys().copied().collect();
        paths.sort_unstable();
        paths
    }

    fn elapsed(&self) -> f64 {
        self.started
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or_default()
    }

    fn generate(&mut self, generator: Generator) -> TagValue {
        let t = self.elapsed();
        match generator {
            Generator::RandomInt { min, max } => TagValue::Int(self.rng.gen_range(min..=max)),
            Generator::RandomReal { min, max } => TagValue::Float(self.rng.gen_range(min..max)),
            Generator::RandomText => {
                TagValue::Text(format!("Value_{}", self.rng.gen_range(1..=100)))
            }
            Generator::RandomBool => TagValue::Bool(self.rng.gen_bool(0.5)),
            Generator::Now => TagValue::Timestamp(Utc::now()),
            Generator::RandomIntArray => TagValue::Array(
                (0..5)
                    .map(|_| TagValue::Int(self.rng.gen_range(0..=100)))
                    .collect(),
            ),
            Generator::Triangle {
                period,
                offset,
                amplitude,
            } => TagValue::Float(offset + amplitude * (2.0 * PI * t / period).sin()),
            Generator::SawTooth { period, scale } => TagValue::Float(scale * (t % period) / period),
            Generator::Square { period, high, low } => {
                TagValue::Float(if t % period < period / 2.0 { high } else { low })
            }
            Generator::SquareBool { period } => TagValue::Bool(t % period < period / 2.0),
        }
    }
}

#[async_trait]
impl TagSession for SimulatedSession {
    async fn connect(&mut self, server: &str, host: &str) -> Result<(), SessionError> {
        if self.connected.is_some() {
            return Err(SessionError::Other("already connected".into()));
        }
        info!(server, host, "simulated opc-da session opened");
        self.connected = Some((server.to_owned(), host.to_owned()));
        self.started = Some(Instant::now());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.connected.take().is_some() {
            debug!("simulated opc-da session closed");
        }
        self.started = None;
        self.written.clear();
        Ok(())
    }

    async fn read(
        &mut self,
        paths: &[String],
        _timeout: Duration,
    ) -> Result<Vec<RawReading>, SessionError> {
        if self.connected.is_none() {
            return Err(SessionError::NotConnected);
        }
        let now = Utc::now();
        let mut readings = Vec::with_capacity(paths.len());
        for path in paths {
            let (value, quality) = if let Some(value) = self.written.get(path) {
                (value.clone(), Quality::GOOD)
            } else if let Some(generator) = self.generators.get(path.as_str()).copied() {
                (self.generate(generator), Quality::GOOD)
            } else {
                debug!(tag = %path, "simulated tag not found");
                (TagValue::Null, Quality::BAD)
            };
            readings.push(
                RawReading::new(path.clone(), value, quality)
                    .with_timestamp(SourceTimestamp::Instant(now)),
            );
        }
        Ok(readings)
    }

    async fn write(
        &mut self,
        path: &str,
        value: &TagValue,
        _timeout: Duration,
    ) -> Result<(), SessionError> {
        if self.connected.is_none() {
            return Err(SessionError::NotConnected);
        }
        debug!(tag = path, value = %value, "simulated write");
        self.written.insert(path.to_owned(), value.clone());
        Ok(())
    }

    async fn info(&mut self) -> Result<Vec<(String, String)>, SessionError> {
        let Some((server, host)) = self.connected.clone() else {
            return Err(SessionError::NotConnected);
        };
        Ok(vec![
            ("Server Name".into(), server),
            ("Host".into(), host),
            ("Version".into(), "3.0 (Simulated)".into()),
            ("Vendor".into(), "R-EMS".into()),
            ("Status".into(), "Running".into()),
            ("Uptime (seconds)".into(), format!("{:.2}", self.elapsed())),
        ])
    }
}
