//! Probe child side: inspect one binary, write its descriptor, return the
//! exit phase.

use std::collections::BTreeMap;
use std::path::Path;

use rhi_schema::host::BINDING_NAMES;
use rhi_schema::{HostDescriptor, PackageVersion, Phase, PluginDescriptor, plugin_descriptor_path};
use uuid::Uuid;

use super::pe::PeImage;
use super::{ProbeError, sdk_table};

/// Binding assembly file beside the host executable, per binding name.
const BINDING_FILES: [&str; 2] = ["Rhino_DotNet.dll", "RhinoCommon.dll"];

/// Host library a plugin imports, and the host major it implies.
const HOST_LIBRARIES: [(&str, u32); 2] = [("Rhino4.exe", 4), ("Rhino.exe", 5)];

/// Inspect a host executable and write its descriptor into `workdir`.
pub fn inspect_host(exe: &Path, workdir: &Path) -> Phase {
    if !workdir.is_dir() {
        tracing::error!("Working directory does not exist: {}", workdir.display());
        return Phase::InspectWorkingDirMissing;
    }
    let host = match describe_host(exe) {
        Ok(host) => host,
        Err(e) => {
            tracing::warn!("Host inspection failed: {e}");
            return e.phase();
        }
    };
    let out = workdir.join(host.probe_file_name());
    match host.write_file(&out) {
        Ok(()) => {
            tracing::info!("Wrote host descriptor {}", out.display());
            Phase::SUCCESS
        }
        Err(e) => {
            tracing::error!("Failed to write {}: {e}", out.display());
            Phase::InspectFailed
        }
    }
}

/// Read everything the engine needs to know about a host executable.
pub fn describe_host(exe: &Path) -> Result<HostDescriptor, ProbeError> {
    let image = PeImage::read(exe)?;
    let version = image.file_version().ok_or_else(|| ProbeError::Malformed {
        path: exe.to_path_buf(),
        message: "no version resource".to_string(),
    })?;
    tracing::info!("Host version: {version}");
    if !matches!(version.major, 4 | 5) {
        return Err(ProbeError::Unsupported(format!(
            "unexpected host version {version}"
        )));
    }

    let (sdk_version, sdk_service_release) = sdk_versions(&image, version);
    tracing::info!("SDK version: {sdk_version}, service release: {sdk_service_release}");

    Ok(HostDescriptor {
        version,
        edition: image.version_string("SpecialBuild").unwrap_or_default(),
        exe_path: exe.to_path_buf(),
        sdk_version,
        sdk_service_release,
        bindings: binding_versions(exe),
        os: image.os(),
    })
}

/// Newer hosts export their SDK versions; older ones are looked up.
fn sdk_versions(image: &PeImage, version: PackageVersion) -> (String, String) {
    if let (Some(sdk), Some(release)) = (
        image.export_u32("RhinoSdkVersion"),
        image.export_u32("RhinoSdkServiceRelease"),
    ) {
        return (sdk.to_string(), release.to_string());
    }
    match sdk_table::lookup(version) {
        Some((sdk, release)) => (sdk.to_string(), release.to_string()),
        None => {
            tracing::warn!("No SDK version known for host {version}");
            (String::new(), String::new())
        }
    }
}

fn binding_versions(exe: &Path) -> BTreeMap<String, String> {
    let Some(folder) = exe.parent() else {
        return BTreeMap::new();
    };
    BINDING_NAMES
        .iter()
        .zip(BINDING_FILES)
        .filter_map(|(name, file)| {
            let path = folder.join(file);
            if !path.is_file() {
                tracing::debug!("{file} not found");
                return None;
            }
            match PeImage::read(&path).map(|image| image.file_version()) {
                Ok(Some(version)) => {
                    tracing::debug!("{file} version: {version}");
                    Some(((*name).to_string(), version.to_string()))
                }
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("{e}");
                    None
                }
            }
        })
        .collect()
}

/// Inspect a plugin binary and write its descriptor beside it.
pub fn inspect_plugin(plugin: &Path) -> Phase {
    let descriptor = match describe_plugin(plugin) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("Plug-in inspection failed: {e}");
            return e.phase();
        }
    };
    let out = plugin_descriptor_path(plugin);
    match descriptor.write_file(&out) {
        Ok(()) => Phase::SUCCESS,
        Err(e) => {
            tracing::error!("Failed to write {}: {e}", out.display());
            Phase::InspectFailed
        }
    }
}

pub fn describe_plugin(plugin: &Path) -> Result<PluginDescriptor, ProbeError> {
    let image = PeImage::read(plugin)?;
    let host_major = HOST_LIBRARIES
        .iter()
        .find(|(library, _)| image.imports_library(library))
        .map(|(_, major)| *major)
        .ok_or_else(|| ProbeError::Unsupported(format!("{} does not link a host", plugin.display())))?;

    let id_text = image
        .export_string("RhinoPlugInId")
        .ok_or_else(|| ProbeError::Unsupported(format!("{} has no plug-in id", plugin.display())))?;
    let id = Uuid::parse_str(id_text.trim())
        .map_err(|e| ProbeError::context("plug-in id", format!("'{id_text}': {e}")))?;

    let title = image
        .export_string("RhinoPlugInName")
        .filter(|t| !t.is_empty())
        .or_else(|| image.version_string("ProductName"))
        .unwrap_or_else(|| {
            plugin
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
    let version = image
        .export_string("RhinoPlugInVersion")
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| image.file_version())
        .unwrap_or_default();

    Ok(PluginDescriptor {
        path: plugin.to_path_buf(),
        id,
        title,
        version,
        os: image.os(),
        host_major,
        sdk_version: image
            .export_u32("RhinoSdkVersion")
            .map(|v| v.to_string())
            .unwrap_or_default(),
        sdk_service_release: image
            .export_u32("RhinoSdkServiceRelease")
            .map(|v| v.to_string())
            .unwrap_or_default(),
    })
}
