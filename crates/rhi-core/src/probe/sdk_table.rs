//! SDK versions of hosts that predate the SDK version exports.
//!
//! Every such host shares one SDK version; the service release is looked up
//! by the `YYYY.MMDD` tail of the executable's file version.

use rhi_schema::PackageVersion;

/// SDK version shared by every host in [`SERVICE_RELEASES`].
pub const LEGACY_SDK_VERSION: &str = "200612060";

const SERVICE_RELEASES: &[(&str, &str)] = &[
    ("2006.1206", "200612060"),
    ("2007.118", "200612060"),
    ("2007.1017", "200710174"),
    ("2008.206", "200710174"),
    ("2008.222", "200802224"),
    ("2008.602", "200806024"),
    ("2008.715", "200807154"),
    ("2008.718", "200807184"),
    ("2008.807", "200808074"),
    ("2008.827", "200808274"),
    ("2008.1215", "200811034"),
    ("2009.108", "200901084"),
    ("2009.116", "200901144"),
    ("2009.121", "200901214"),
    ("2009.126", "200901214"),
    ("2009.226", "200902264"),
    ("2009.519", "200905084"),
    ("2009.528", "200905084"),
    ("2009.624", "200905084"),
    ("2009.709", "200905084"),
    ("2009.802", "200905084"),
    ("2009.813", "200905084"),
    ("2009.922", "200905084"),
    ("2009.1027", "200905084"),
    ("2009.1030", "200905084"),
    ("2009.1130", "200905084"),
    ("2009.1214", "200912014"),
    ("2010.401", "201003104"),
];

/// `(sdk_version, service_release)` for a legacy host build, if known.
pub fn lookup(version: PackageVersion) -> Option<(&'static str, &'static str)> {
    let key = format!("{}.{}", version.build, version.revision);
    SERVICE_RELEASES
        .iter()
        .find(|(build, _)| *build == key)
        .map(|(_, release)| (LEGACY_SDK_VERSION, *release))
}
