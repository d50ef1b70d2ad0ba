//! RPM dialects: yum and dnf differ only in the tool name and a few flags.

use kubesmith_remote::ExitAllowance;

use crate::decode;
use crate::manager::{Dialect, KeyInstall, PackageManager, Repository};

const KEY_DIR: &str = "/etc/pki/rpm-gpg";

/// `check-update` exits with 100 when updates are available.
fn check_update_allowance() -> Vec<ExitAllowance> {
    vec![ExitAllowance::new("check-update", 100)]
}

fn rpm_key(url: &str, name: &str) -> KeyInstall {
    let path = format!("{KEY_DIR}/{name}.gpg");
    KeyInstall {
        commands: vec![
            format!("sudo mkdir -p {KEY_DIR}"),
            format!("curl -fsSL {url} | sudo tee {path} >/dev/null"),
            format!("sudo rpm --import {path}"),
        ],
        path,
    }
}

fn rpm_repository(repo: &Repository, key_path: Option<&str>) -> String {
    let gpg = key_path.map_or_else(
        || "gpgcheck=0".to_owned(),
        |k| format!("gpgcheck=1\\ngpgkey=file://{k}"),
    );
    format!(
        "sudo bash -c 'echo -e \"[{}]\\nname={}\\nbaseurl={}\\nenabled=1\\n{gpg}\\n\" > /etc/yum.repos.d/{}.repo'",
        repo.short_name,
        repo.name,
        repo.address.replace('$', "\\$"),
        repo.file_name
    )
}

fn rpm_remove(tool: &str, name: &str) -> Vec<String> {
    vec![
        format!("sudo {tool} remove -y {name}"),
        format!("sudo rpm -e --nodeps {name} || true"),
    ]
}

macro_rules! rpm_dialect {
    ($ty:ident, $dialect:expr, $tool:literal, $refresh:literal, $base:expr) => {
        impl PackageManager for $ty {
            fn dialect(&self) -> Dialect {
                $dialect
            }

            fn query_installed(&self, name: &str) -> String {
                format!(concat!("sudo ", $tool, " list installed 2>/dev/null | grep ^{} | head -1"), name)
            }

            fn decode_installed(&self, name: &str, output: &str) -> Option<String> {
                decode::rpm_installed(name, output)
            }

            fn list_available(&self, name: &str) -> String {
                format!(concat!("sudo ", $tool, " list {} --showduplicates 2>/dev/null"), name)
            }

            fn decode_available(&self, name: &str, output: &str) -> Vec<String> {
                decode::rpm_available(name, output)
            }

            fn version_separator(&self) -> char {
                '-'
            }

            fn install(&self, packages: &[String]) -> String {
                format!(concat!("sudo ", $tool, " install -y --setopt=obsoletes=0 {}"), packages.join(" "))
            }

            fn downgrade(&self, packages: &[String]) -> String {
                format!(concat!("sudo ", $tool, " downgrade -y --setopt=obsoletes=0 {}"), packages.join(" "))
            }

            fn remove(&self, name: &str) -> Vec<String> {
                rpm_remove($tool, name)
            }

            fn hold(&self, name: &str) -> String {
                format!(concat!("sudo ", $tool, " versionlock add {}"), name)
            }

            fn update_repos(&self) -> String {
                concat!("sudo ", $tool, " check-update -y; ", $refresh).to_owned()
            }

            fn key_dir(&self) -> &'static str {
                KEY_DIR
            }

            fn add_gpg_key(&self, url: &str, name: &str) -> KeyInstall {
                rpm_key(url, name)
            }

            fn add_repository(&self, repo: &Repository, key_path: Option<&str>) -> String {
                rpm_repository(repo, key_path)
            }

            fn remove_repository_files(&self, prefix: &str) -> String {
                format!("sudo rm -f /etc/yum.repos.d/{prefix}*.repo")
            }

            fn allowed_exits(&self) -> Vec<ExitAllowance> {
                check_update_allowance()
            }

            fn base_packages(&self) -> &'static [&'static str] {
                $base
            }
        }
    };
}

/// yum, CentOS.
#[derive(Debug, Default, Clone, Copy)]
pub struct Yum;

/// dnf, Rocky Linux.
#[derive(Debug, Default, Clone, Copy)]
pub struct Dnf;

rpm_dialect!(
    Yum,
    Dialect::Yum,
    "yum",
    "sudo yum makecache fast -y",
    &["gnupg2", "yum-utils", "yum-plugin-versionlock"]
);
rpm_dialect!(
    Dnf,
    Dialect::Dnf,
    "dnf",
    "sudo dnf makecache --refresh",
    &["gnupg2", "yum-utils", "python3-dnf-plugin-versionlock"]
);
