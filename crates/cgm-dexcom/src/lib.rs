//! Decoder for Dexcom receiver XML exports.
//!
//! A receiver export is a flat list of elements:
//!
//! ```xml
//! <Patient SerialNumber="SM12345678">
//!   <GlucoseReadings>
//!     <Glucose InternalTime="2014-02-20 14:06:03" DisplayTime="2014-02-20 06:06:48" Value="108"/>
//!   </GlucoseReadings>
//!   <MeterReadings>
//!     <Meter InternalTime="2014-02-20 14:10:00" DisplayTime="2014-02-20 06:10:45" Value="121"/>
//!   </MeterReadings>
//!   <EventMarkers>
//!     <Event InternalTime="2014-01-31 16:39:46" DisplayTime="2014-01-31 08:39:59"
//!            EventTime="2014-01-31 08:39:00" EventType="Carbs" Decription="Carbs 45 grams"/>
//!   </EventMarkers>
//! </Patient>
//! ```
//!
//! Receivers spell the description attribute `Decription`; both spellings are read.
//! Files ending in `.xml.gz` are gunzipped on the fly.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use cgm_core::{DecodeError, DecodedFile, EventDecoder, RawEvent, RawFields, SourceKind};
use flate2::read::GzDecoder;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event as XmlEvent};

/// Device id used when the export names none.
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Reads `.xml` and `.xml.gz` receiver exports.
#[derive(Debug, Default, Clone, Copy)]
pub struct DexcomXmlDecoder;

impl DexcomXmlDecoder {
    pub const fn new() -> Self {
        Self
    }
}

impl EventDecoder for DexcomXmlDecoder {
    fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let name = name.to_ascii_lowercase();
        name.ends_with(".xml") || name.ends_with(".xml.gz")
    }

    fn decode(&self, path: &Path) -> Result<DecodedFile, DecodeError> {
        let file = File::open(path).map_err(|source| DecodeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let compressed = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
        let reader: Box<dyn BufRead> = if compressed {
            Box::new(BufReader::new(GzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        decode_reader(reader).map_err(|source| DecodeError::Format {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }
}

/// Decodes a receiver export from any buffered reader.
///
/// Events are returned in document order.
pub fn decode_reader<R: BufRead>(reader: R) -> Result<DecodedFile, quick_xml::Error> {
    let mut xml_reader = Reader::from_reader(reader);
    xml_reader.trim_text(true);

    let mut device: Option<String> = None;
    let mut events = Vec::new();
    let mut buf = Vec::new();

    loop {
        match xml_reader.read_event_into(&mut buf)? {
            XmlEvent::Start(ref e) | XmlEvent::Empty(ref e) => {
                let source = match e.local_name().as_ref() {
                    b"Glucose" => Some(SourceKind::Glucose),
                    b"Meter" => Some(SourceKind::CalibrationMeter),
                    b"Event" => Some(SourceKind::Event),
                    _ => None,
                };
                match source {
                    Some(source) => events.push(raw_event(source, e)?),
                    None => {
                        if device.is_none() {
                            device = serial_number(e)?;
                        }
                    }
                }
            }
            XmlEvent::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(DecodedFile {
        device: device.unwrap_or_else(|| UNKNOWN_DEVICE.to_string()),
        events,
    })
}

fn raw_event(source: SourceKind, element: &BytesStart<'_>) -> Result<RawEvent, quick_xml::Error> {
    let mut fields = RawFields::default();
    for attr in element.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?.into_owned();
        match attr.key.as_ref() {
            b"DisplayTime" => fields.display_time = value,
            b"InternalTime" => fields.internal_time = value,
            b"EventTime" => fields.event_time = Some(value),
            b"Value" => fields.value = Some(value),
            b"EventType" => fields.event_type = Some(value),
            b"Decription" | b"Description" => fields.description = Some(value),
            _ => {}
        }
    }
    Ok(RawEvent { source, fields })
}

fn serial_number(element: &BytesStart<'_>) -> Result<Option<String>, quick_xml::Error> {
    for attr in element.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == b"SerialNumber" {
            let serial = attr.unescape_value()?.trim().to_string();
            if !serial.is_empty() {
                return Ok(Some(serial));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    const EXPORT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Patient Id="{0}" SerialNumber="SM40170636" IsDataBlinded="0">
  <GlucoseReadings>
    <Glucose InternalTime="2014-02-20 14:06:03" DisplayTime="2014-02-20 06:06:48" Value="108" />
    <Glucose InternalTime="2014-02-20 14:11:03" DisplayTime="2014-02-20 06:11:48" Value="Low" />
  </GlucoseReadings>
  <MeterReadings>
    <Meter InternalTime="2014-02-20 14:10:00" DisplayTime="2014-02-20 06:10:45" Value="121" />
  </MeterReadings>
  <EventMarkers>
    <Event InternalTime="2014-01-31 16:39:46" DisplayTime="2014-01-31 08:39:59" EventTime="2014-01-31 08:39:00" EventType="Carbs" Decription="Carbs 45 grams" />
    <Event InternalTime="2014-01-31 17:00:00" DisplayTime="2014-01-31 09:00:13" EventTime="2014-01-31 08:55:00" EventType="Health" Description="Illness &amp; stress" />
  </EventMarkers>
</Patient>
"#;

    fn summarize(decoded: &DecodedFile) -> String {
        decoded
            .events
            .iter()
            .map(|e| {
                format!(
                    "{:?} display={} internal={} event={:?} value={:?} type={:?} desc={:?}",
                    e.source,
                    e.fields.display_time,
                    e.fields.internal_time,
                    e.fields.event_time,
                    e.fields.value,
                    e.fields.event_type,
                    e.fields.description,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn decodes_readings_and_markers_in_document_order() {
        let decoded = decode_reader(EXPORT.as_bytes()).unwrap();
        assert_eq!(decoded.device, "SM40170636");
        insta::assert_snapshot!(summarize(&decoded), @r#"
        Glucose display=2014-02-20 06:06:48 internal=2014-02-20 14:06:03 event=None value=Some("108") type=None desc=None
        Glucose display=2014-02-20 06:11:48 internal=2014-02-20 14:11:03 event=None value=Some("Low") type=None desc=None
        CalibrationMeter display=2014-02-20 06:10:45 internal=2014-02-20 14:10:00 event=None value=Some("121") type=None desc=None
        Event display=2014-01-31 08:39:59 internal=2014-01-31 16:39:46 event=Some("2014-01-31 08:39:00") value=None type=Some("Carbs") desc=Some("Carbs 45 grams")
        Event display=2014-01-31 09:00:13 internal=2014-01-31 17:00:00 event=Some("2014-01-31 08:55:00") value=None type=Some("Health") desc=Some("Illness & stress")
        "#);
    }

    #[test]
    fn missing_serial_number_is_unknown_device() {
        let xml = r#"<GlucoseReadings><Glucose InternalTime="2014-02-20 14:06:03" DisplayTime="2014-02-20 06:06:48" Value="99"/></GlucoseReadings>"#;
        let decoded = decode_reader(xml.as_bytes()).unwrap();
        assert_eq!(decoded.device, UNKNOWN_DEVICE);
        assert_eq!(decoded.events.len(), 1);
    }

    #[test]
    fn accepts_plain_and_gzipped_exports() {
        let decoder = DexcomXmlDecoder::new();
        assert!(decoder.accepts(Path::new("in/export.xml")));
        assert!(decoder.accepts(Path::new("in/EXPORT.XML")));
        assert!(decoder.accepts(Path::new("in/export.xml.gz")));
        assert!(!decoder.accepts(Path::new("in/export.csv")));
        assert!(!decoder.accepts(Path::new("in/archive.gz")));
    }

    #[test]
    fn gzipped_export_decodes_like_plain() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("export.xml");
        std::fs::write(&plain, EXPORT).unwrap();
        let gz = dir.path().join("export.xml.gz");
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(EXPORT.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let decoder = DexcomXmlDecoder::new();
        assert_eq!(decoder.decode(&plain).unwrap(), decoder.decode(&gz).unwrap());
    }

    #[test]
    fn mismatched_tags_are_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.xml");
        std::fs::write(&path, "<Patient><GlucoseReadings></Patient>").unwrap();

        let err = DexcomXmlDecoder::new().decode(&path).unwrap_err();
        assert!(matches!(err, DecodeError::Format { .. }));
    }

    #[test]
    fn corrupt_gzip_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.xml.gz");
        std::fs::write(&path, EXPORT).unwrap();

        let err = DexcomXmlDecoder::new().decode(&path).unwrap_err();
        assert!(matches!(err, DecodeError::Format { .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DexcomXmlDecoder::new()
            .decode(&dir.path().join("absent.xml"))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Io { .. }));
    }
}
