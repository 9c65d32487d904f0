use diagral_client::AlarmConfiguration;

use crate::engine::Device;
use crate::engine::EntityDescriptor;
use crate::engine::EntityKind;

pub const DOMAIN: &str = "diagral";
const BRAND: &str = "Diagral";

/// `{entry}_diagral_{serial}_{key}`
pub fn unique_id(entry: &str, serial: &str, key: &str) -> String {
    format!("{}_{}_{}_{}", entry, DOMAIN, serial, key)
}

/// Device entry for the alarm central.
pub fn central_device(configuration: &AlarmConfiguration) -> Device {
    let name = match configuration.alarm.name.as_deref() {
        Some(name) if !name.trim().is_empty() => title_case(name),
        _ => format!("{} Central", BRAND),
    };

    Device {
        identifiers: vec![(
            DOMAIN.to_string(),
            configuration.alarm.central.serial.clone(),
        )],
        name,
        manufacturer: Some(BRAND.to_string()),
        model: Some(format!("{} Alarm", BRAND)),
        sw_version: Some(configuration.sw_version()),
    }
}

/// Descriptor shared by every entity of a Diagral entry.
///
/// The entity id is `{kind}.{entry}` for the panel and
/// `{kind}.{entry}_{key}` for everything else.
pub fn descriptor(
    entry: &str,
    configuration: &AlarmConfiguration,
    kind: EntityKind,
    key: &str,
    name: &str,
) -> EntityDescriptor {
    let entry_slug = slugify(entry);
    let object_id = if kind == EntityKind::AlarmControlPanel {
        entry_slug
    } else {
        format!("{}_{}", entry_slug, key)
    };

    let mut descriptor = EntityDescriptor::new(
        kind,
        &object_id,
        unique_id(entry, &configuration.alarm.central.serial, key),
        central_device(configuration),
    );
    descriptor.name = Some(name.to_string());
    descriptor
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn slugify(s: &str) -> String {
    let slug: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    slug.trim_matches('_').to_string()
}
