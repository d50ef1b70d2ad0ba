//! Debian-style dialect.

use kubesmith_remote::ExitAllowance;

use crate::decode;
use crate::manager::{Dialect, KeyInstall, PackageManager, Repository};

const INSTALL: &str = "sudo apt-get install -f -y --allow-unauthenticated --allow-downgrades \
                       -o DPkg::Options::=\"--force-confnew\"";

/// apt and dpkg.
#[derive(Debug, Default, Clone, Copy)]
pub struct Apt;

impl PackageManager for Apt {
    fn dialect(&self) -> Dialect {
        Dialect::Apt
    }

    fn query_installed(&self, name: &str) -> String {
        format!("dpkg --list {name} 2>/dev/null | tail -n 1")
    }

    fn decode_installed(&self, name: &str, output: &str) -> Option<String> {
        decode::dpkg_installed(name, output)
    }

    fn list_available(&self, name: &str) -> String {
        format!("sudo apt list -a {name} 2>/dev/null")
    }

    fn decode_available(&self, name: &str, output: &str) -> Vec<String> {
        decode::apt_available(name, output)
    }

    fn version_separator(&self) -> char {
        '='
    }

    fn install(&self, packages: &[String]) -> String {
        format!("{INSTALL} {}", packages.join(" "))
    }

    // apt installs an older explicit version when --allow-downgrades is given.
    fn downgrade(&self, packages: &[String]) -> String {
        self.install(packages)
    }

    fn remove(&self, name: &str) -> Vec<String> {
        vec![
            format!("sudo apt-get purge -y {name} --allow-change-held-packages"),
            format!("sudo dpkg -P {name}"),
        ]
    }

    fn hold(&self, name: &str) -> String {
        format!("sudo apt-mark hold {name}")
    }

    fn update_repos(&self) -> String {
        "sudo apt-get update -y".to_owned()
    }

    fn key_dir(&self) -> &'static str {
        "/etc/apt/keyrings"
    }

    fn add_gpg_key(&self, url: &str, name: &str) -> KeyInstall {
        let path = format!("{}/{name}.gpg", self.key_dir());
        KeyInstall {
            commands: vec![
                format!("sudo mkdir -p {}", self.key_dir()),
                format!("curl -fsSL {url} | sudo gpg --dearmor --yes -o {path}"),
            ],
            path,
        }
    }

    fn add_repository(&self, repo: &Repository, key_path: Option<&str>) -> String {
        let trust = key_path.map_or_else(|| "trusted=yes".to_owned(), |k| format!("signed-by={k}"));
        format!(
            "echo \"deb [arch=amd64 {trust}] {}\" | sudo tee /etc/apt/sources.list.d/{}.list",
            repo.address, repo.file_name
        )
    }

    fn remove_repository_files(&self, prefix: &str) -> String {
        format!("sudo rm -f /etc/apt/sources.list.d/{prefix}*.list")
    }

    fn allowed_exits(&self) -> Vec<ExitAllowance> {
        Vec::new()
    }

    fn base_packages(&self) -> &'static [&'static str] {
        &["gnupg", "apt-transport-https"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> Repository {
        Repository {
            name: "Docker".into(),
            short_name: "docker".into(),
            file_name: "docker".into(),
            address: "https://download.docker.com/linux/ubuntu $(lsb_release -cs) stable".into(),
            gpg_key_url: Some("https://download.docker.com/linux/ubuntu/gpg".into()),
        }
    }

    #[test]
    fn signed_repository_line() {
        assert_eq!(
            Apt.add_repository(&repo(), Some("/etc/apt/keyrings/docker.gpg")),
            "echo \"deb [arch=amd64 signed-by=/etc/apt/keyrings/docker.gpg] \
             https://download.docker.com/linux/ubuntu $(lsb_release -cs) stable\" \
             | sudo tee /etc/apt/sources.list.d/docker.list"
        );
    }

    #[test]
    fn unsigned_repository_is_trusted() {
        assert!(Apt.add_repository(&repo(), None).contains("[arch=amd64 trusted=yes]"));
    }

    #[test]
    fn key_is_dearmored_into_keyrings() {
        let key = Apt.add_gpg_key("https://example.test/key", "kubernetes");
        assert_eq!(key.path, "/etc/apt/keyrings/kubernetes.gpg");
        assert_eq!(
            key.commands[1],
            "curl -fsSL https://example.test/key | sudo gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes.gpg"
        );
    }

    #[test]
    fn install_batches_arguments() {
        let cmd = Apt.install(&["kubelet=1.24.6-00".into(), "kubectl=1.24.6-00".into()]);
        assert!(cmd.starts_with("sudo apt-get install -f -y"));
        assert!(cmd.ends_with("kubelet=1.24.6-00 kubectl=1.24.6-00"));
    }
}
