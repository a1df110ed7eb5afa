//! Service listing (LISTXML reply) parsing and rendering
//!
//! The controller answers LISTXML with a DATA frame holding an XML document:
//!
//! ```text
//! <services>
//!   <service name="motors" format="bools" description="Motor enable flags"/>
//!   ...
//! </services>
//! ```
//!
//! Elements without a `name` or `format` are skipped with a warning.

use crate::error::{Error, Result};
use crate::service::Service;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;

const SERVICE_TAG: &[u8] = b"service";

/// Parse a listing into a name → service map
pub fn parse(xml: &[u8]) -> Result<HashMap<String, Service>> {
    let text = std::str::from_utf8(xml).map_err(|e| Error::Xml(e.to_string()))?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut services = HashMap::new();
    let mut depth = 0usize;
    let mut saw_root = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                depth += 1;
                saw_root = true;
                if e.name().as_ref() == SERVICE_TAG {
                    insert_service(&e, &mut services)?;
                }
            }
            Event::Empty(e) => {
                saw_root = true;
                if e.name().as_ref() == SERVICE_TAG {
                    insert_service(&e, &mut services)?;
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(Error::Xml("listing has no root element".to_string()));
    }
    if depth != 0 {
        return Err(Error::Xml("listing ended inside an element".to_string()));
    }

    log::debug!("Parsed service listing with {} services", services.len());
    Ok(services)
}

fn insert_service(e: &BytesStart<'_>, services: &mut HashMap<String, Service>) -> Result<()> {
    let mut name = None;
    let mut format = None;
    let mut description = None;

    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Xml(e.to_string()))?;
        let value = attr.unescape_value()?.into_owned();
        match attr.key.as_ref() {
            b"name" => name = Some(value),
            b"format" => format = Some(value),
            b"description" => description = Some(value),
            _ => {}
        }
    }

    match (name, format) {
        (Some(name), Some(format)) if !name.is_empty() => {
            let service = Service::new(name.clone(), format, description);
            services.insert(name, service);
        }
        (name, _) => {
            log::warn!("Skipping malformed service element (name: {:?})", name);
        }
    }
    Ok(())
}

/// Render services as a listing document
pub fn render<'a>(services: impl IntoIterator<Item = &'a Service>) -> String {
    let mut xml = String::from("<services>");
    for service in services {
        xml.push_str("<service name=\"");
        xml.push_str(&escape(service.name()));
        xml.push_str("\" format=\"");
        xml.push_str(&escape(service.format()));
        xml.push('"');
        if let Some(description) = service.description() {
            xml.push_str(" description=\"");
            xml.push_str(&escape(description));
            xml.push('"');
        }
        xml.push_str("/>");
    }
    xml.push_str("</services>");
    xml
}
