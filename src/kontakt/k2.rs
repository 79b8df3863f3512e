//! Generations 2 through 4.1 compress an XML program description instead
//! of the later preset-chunk tree. Read-only.

use serde::Deserialize;

use crate::dtype::ConvError;

#[derive(Debug, Deserialize)]
#[serde(rename = "K2_Container")]
pub struct K2Container {
    #[serde(rename = "@version", default)]
    pub version: String,
    #[serde(rename = "Program", default)]
    pub programs: Vec<K2Program>,
}

#[derive(Debug, Deserialize)]
pub struct K2Program {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@volume", default)]
    pub volume_db: f64,
    #[serde(rename = "@tune", default)]
    pub tune: f64,
    #[serde(rename = "Group", default)]
    pub groups: Vec<K2Group>,
    #[serde(rename = "AmpEnv")]
    pub amp_env: Option<K2Envelope>,
    #[serde(rename = "PitchEnv")]
    pub pitch_env: Option<K2Envelope>,
    #[serde(rename = "Filter")]
    pub filter: Option<K2Filter>,
}

#[derive(Debug, Deserialize)]
pub struct K2Group {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@playMode", default)]
    pub play_mode: String,
    #[serde(rename = "Zone", default)]
    pub zones: Vec<K2Zone>,
}

#[derive(Debug, Deserialize)]
pub struct K2Zone {
    #[serde(rename = "@sample")]
    pub sample: String,
    #[serde(rename = "@keyLow", default)]
    pub key_low: u8,
    #[serde(rename = "@keyHigh", default = "k127")]
    pub key_high: u8,
    #[serde(rename = "@root", default = "k60")]
    pub root: u8,
    #[serde(rename = "@velLow", default)]
    pub vel_low: u8,
    #[serde(rename = "@velHigh", default = "k127")]
    pub vel_high: u8,
    #[serde(rename = "@start", default)]
    pub start: u64,
    #[serde(rename = "@end", default)]
    pub end: u64,
    #[serde(rename = "@tune", default)]
    pub tune: f64,
    #[serde(rename = "@gain", default)]
    pub gain_db: f64,
    #[serde(rename = "@pan", default)]
    pub pan: f64,
    #[serde(rename = "Loop", default)]
    pub loops: Vec<K2Loop>,
}

fn k127() -> u8 {
    127
}
fn k60() -> u8 {
    60
}

#[derive(Debug, Deserialize)]
pub struct K2Loop {
    #[serde(rename = "@mode", default)]
    pub mode: String,
    #[serde(rename = "@start", default)]
    pub start: u64,
    #[serde(rename = "@end", default)]
    pub end: u64,
    #[serde(rename = "@crossfade", default)]
    pub crossfade: u64,
}

#[derive(Debug, Deserialize)]
pub struct K2Envelope {
    #[serde(rename = "@attack", default)]
    pub attack: f64,
    #[serde(rename = "@hold", default)]
    pub hold: f64,
    #[serde(rename = "@decay", default)]
    pub decay: f64,
    #[serde(rename = "@sustain", default)]
    pub sustain: f64,
    #[serde(rename = "@release", default)]
    pub release: f64,
    #[serde(rename = "@depth", default)]
    pub depth: f64,
}

#[derive(Debug, Deserialize)]
pub struct K2Filter {
    #[serde(rename = "@type", default)]
    pub filter_type: String,
    #[serde(rename = "@cutoff", default)]
    pub cutoff_hz: f64,
    #[serde(rename = "@resonance", default)]
    pub resonance: f64,
}

pub fn parse(xml: &str) -> Result<K2Container, ConvError> {
    Ok(quick_xml::de::from_str(xml)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_program_with_zones_and_envelope() {
        let xml = r#"<K2_Container version="4.0">
  <Program name="EP" volume="-2" tune="0">
    <Group name="Main" playMode="round_robin">
      <Zone sample="Samples\EP_C3.wav" keyLow="40" keyHigh="52" root="48" start="0" end="22050">
        <Loop mode="until_end" start="100" end="22000" crossfade="10"/>
      </Zone>
    </Group>
    <AmpEnv attack="0.002" decay="0.4" sustain="0.7" release="0.3"/>
  </Program>
</K2_Container>"#;
        let container = parse(xml).unwrap();
        assert_eq!(container.programs.len(), 1);
        let program = &container.programs[0];
        assert_eq!(program.name, "EP");
        assert_eq!(program.groups[0].zones[0].root, 48);
        assert_eq!(program.groups[0].zones[0].loops[0].end, 22000);
        assert_eq!(program.amp_env.as_ref().unwrap().sustain, 0.7);
    }
}
