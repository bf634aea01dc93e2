//! Resolves the image schematic identity from a node's extension statuses

use crate::node::ExtensionStatusSpec;
use fleet_core::machine::SchematicInfo;

/// Description carried by the virtual extension that publishes the schematic
/// id as its version.
pub const SCHEMATIC_EXTENSION_DESCRIPTION: &str =
    "Virtual extension which describes the image schematic";

/// Name prefix of official extensions distributed through the image factory.
pub const OFFICIAL_EXTENSION_PREFIX: &str = "siderolabs/";

/// Schematic id of an image with no extensions at all: the canonical hash of
/// the empty schematic.
pub const DEFAULT_SCHEMATIC_ID: &str =
    "376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba";

/// Determine the schematic identity of a machine from its extension
/// statuses.
///
/// The virtual schematic extension wins when present; otherwise any
/// unrecognized extension makes the schematic invalid (the image was built
/// outside the factory), and a machine without extensions runs the default
/// (empty) schematic.
pub fn resolve<'a, I>(extensions: I) -> SchematicInfo
where
    I: IntoIterator<Item = &'a ExtensionStatusSpec>,
{
    let extensions: Vec<&ExtensionStatusSpec> = extensions.into_iter().collect();

    if let Some(marker) = extensions
        .iter()
        .find(|ext| ext.description == SCHEMATIC_EXTENSION_DESCRIPTION)
    {
        return SchematicInfo {
            id: marker.version.clone(),
            invalid: false,
        };
    }

    let unknown = extensions
        .iter()
        .any(|ext| !ext.name.starts_with(OFFICIAL_EXTENSION_PREFIX));
    if unknown {
        return SchematicInfo {
            id: String::new(),
            invalid: true,
        };
    }

    SchematicInfo {
        id: DEFAULT_SCHEMATIC_ID.to_string(),
        invalid: false,
    }
}
