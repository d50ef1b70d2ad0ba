//! Decoders for package tool output.
//!
//! Every parse of `dpkg`, `apt`, `yum` and `dnf` output lives here.

/// Installed version from a `dpkg --list <name>` line.
///
/// Only `ii` (installed) and `hi` (held) rows count as installed.
#[must_use]
pub fn dpkg_installed(name: &str, output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [status, pkg, version, ..]
                if (status.starts_with("ii") || status.starts_with("hi"))
                    && base_name(pkg) == name =>
            {
                Some((*version).to_owned())
            }
            _ => None,
        }
    })
}

/// Installed version from a `yum|dnf list installed` line.
#[must_use]
pub fn rpm_installed(name: &str, output: &str) -> Option<String> {
    rpm_rows(name, output).next()
}

/// Candidate versions from `apt list -a <name>`.
///
/// Raw versions are kept, as apt needs the full string to install.
#[must_use]
pub fn apt_available(name: &str, output: &str) -> Vec<String> {
    let prefix = format!("{name}/");
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pkg = fields.next()?;
            let version = fields.next()?;
            pkg.starts_with(&prefix).then(|| version.to_owned())
        })
        .collect()
}

/// Candidate versions from `yum|dnf list <name> --showduplicates`.
///
/// Epoch and release are removed, matching what `name-version` accepts.
#[must_use]
pub fn rpm_available(name: &str, output: &str) -> Vec<String> {
    let mut versions: Vec<String> = Vec::new();
    for version in rpm_rows(name, output) {
        let short = crate::version::strip_release(&version).to_owned();
        if !versions.contains(&short) {
            versions.push(short);
        }
    }
    versions
}

/// Distribution name from `/etc/os-release`'s `NAME` field.
#[must_use]
pub fn os_name(output: &str) -> String {
    output.trim().trim_matches('"').to_lowercase()
}

fn rpm_rows<'a>(name: &'a str, output: &'a str) -> impl Iterator<Item = String> + 'a {
    output.lines().filter_map(move |line| {
        let mut fields = line.split_whitespace();
        let pkg = fields.next()?;
        let version = fields.next()?;
        let (pkg_name, _arch) = pkg.rsplit_once('.')?;
        (pkg_name == name).then(|| version.to_owned())
    })
}

fn base_name(pkg: &str) -> &str {
    pkg.split_once(':').map_or(pkg, |(n, _)| n)
}
