use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Separator between the version, architecture, and mode segments of a key.
pub const SEGMENT_SEPARATOR: char = '~';

/// Marker appended to keys of globally scoped installs.
pub const GLOBAL_MARKER: &str = "-global";

/// Mode suffix for ASP.NET Core runtime installs. The plain runtime carries
/// no suffix, which is the historical default key shape.
pub const ASPNETCORE_SUFFIX: &str = "aspnetcore";

/// Owner token recorded when the end user requested an install directly,
/// as opposed to an extension identifier or an unknown legacy owner.
pub const USER_OWNER: &str = "user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallMode {
    Sdk,
    Runtime,
    AspNetCore,
}

impl InstallMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sdk => "sdk",
            Self::Runtime => "runtime",
            Self::AspNetCore => "aspnetcore",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "sdk" => Ok(Self::Sdk),
            "runtime" => Ok(Self::Runtime),
            "aspnetcore" => Ok(Self::AspNetCore),
            _ => Err(anyhow!("invalid install mode: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallScope {
    Local,
    Global,
}

impl InstallScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
        }
    }
}

/// Identity of one .NET install. Two identities refer to the same install
/// exactly when their derived keys match; the key is the only basis for
/// comparison, so this type deliberately does not implement `PartialEq`.
///
/// `architecture: None` is the legacy no-architecture shape kept for
/// compatibility with old persisted records. New identities built through
/// [`InstallIdentity::new`] always carry an architecture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallIdentity {
    pub version: String,
    pub architecture: Option<String>,
    pub mode: InstallMode,
    pub scope: InstallScope,
}

impl InstallIdentity {
    /// Builds an identity, defaulting an unset architecture to the native
    /// architecture of the current platform.
    pub fn new(
        version: impl Into<String>,
        architecture: Option<&str>,
        mode: InstallMode,
        scope: InstallScope,
    ) -> Self {
        Self {
            version: version.into(),
            architecture: Some(
                architecture
                    .map(str::to_string)
                    .unwrap_or_else(|| native_architecture().to_string()),
            ),
            mode,
            scope,
        }
    }

    /// Builds the legacy no-architecture shape. Only used when round-tripping
    /// records written before architectures were part of the key.
    pub fn legacy_no_arch(version: impl Into<String>, mode: InstallMode) -> Self {
        Self {
            version: version.into(),
            architecture: None,
            mode,
            scope: InstallScope::Local,
        }
    }

    /// Canonical string key: `version[~arch][-global][~aspnetcore]`.
    ///
    /// Pure and deterministic in the four fields; deriving twice yields the
    /// same string.
    pub fn key(&self) -> String {
        let mut key = self.version.clone();
        if let Some(arch) = &self.architecture {
            key.push(SEGMENT_SEPARATOR);
            key.push_str(arch);
        }
        if matches!(self.scope, InstallScope::Global) {
            key.push_str(GLOBAL_MARKER);
        }
        if matches!(self.mode, InstallMode::AspNetCore) {
            key.push(SEGMENT_SEPARATOR);
            key.push_str(ASPNETCORE_SUFFIX);
        }
        key
    }

    pub fn is_equivalent(&self, other: &InstallIdentity) -> bool {
        self.key() == other.key()
    }

    /// Name of the directory the install materializes under: the key without
    /// the scope marker. Global installs are managed by the OS installer and
    /// never materialize under the storage root.
    pub fn directory_name(&self) -> String {
        let mut name = self.version.clone();
        if let Some(arch) = &self.architecture {
            name.push(SEGMENT_SEPARATOR);
            name.push_str(arch);
        }
        if matches!(self.mode, InstallMode::AspNetCore) {
            name.push(SEGMENT_SEPARATOR);
            name.push_str(ASPNETCORE_SUFFIX);
        }
        name
    }
}

/// Parses a key in any historical format back into an identity.
///
/// The global marker is split off first so that a key carrying both the
/// marker and the architecture separator cannot misparse the marker as part
/// of an architecture segment. A bare string with neither separator is the
/// oldest format: the whole string is the version, scope is local, and the
/// mode is inferred from the version shape.
pub fn parse_legacy_key(key: &str) -> InstallIdentity {
    let (body, scope, marker_mode) = match key.split_once(GLOBAL_MARKER) {
        Some((body, rest)) => {
            let mode = rest
                .strip_prefix(SEGMENT_SEPARATOR)
                .filter(|suffix| *suffix == ASPNETCORE_SUFFIX)
                .map(|_| InstallMode::AspNetCore);
            (body, InstallScope::Global, mode)
        }
        None => (key, InstallScope::Local, None),
    };

    let mut segments = body.split(SEGMENT_SEPARATOR);
    let version = segments.next().unwrap_or_default().to_string();
    let mut architecture = None;
    let mut mode = marker_mode;
    for segment in segments {
        if segment == ASPNETCORE_SUFFIX {
            mode = Some(InstallMode::AspNetCore);
        } else if architecture.is_none() && !segment.is_empty() {
            architecture = Some(segment.to_string());
        }
    }

    let mode = mode.unwrap_or_else(|| {
        if looks_like_sdk_version(&version) {
            InstallMode::Sdk
        } else {
            InstallMode::Runtime
        }
    });

    InstallIdentity {
        version,
        architecture,
        mode,
        scope,
    }
}

/// SDK feature-band versions carry a three-digit patch (`8.0.100`); runtime
/// patches stay below 100. Versions that do not parse as full semver
/// (e.g. a bare `8.0` channel) are runtime-style.
fn looks_like_sdk_version(version: &str) -> bool {
    match semver::Version::parse(version) {
        Ok(parsed) => parsed.patch >= 100,
        Err(_) => false,
    }
}

/// Architecture token for the current platform, in .NET naming.
pub fn native_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "x86",
        "arm" => "arm",
        other => other,
    }
}
