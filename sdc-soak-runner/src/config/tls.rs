// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Locating TLS material.

use crate::{device::TlsMaterial, errors::TlsConfigError};
use camino::{Utf8Path, Utf8PathBuf};

/// The passphrase the sample certificates ship with.
pub const DUMMY_PASSPHRASE: &str = "dummypass";

/// The encrypted private key.
pub const PRIVATE_KEY_FILE: &str = "user_private_key_encrypted.pem";

/// The certificate signed by the root certificate.
pub const CERTIFICATE_FILE: &str = "user_certificate_root_signed.pem";

/// The root certificate.
pub const CA_PUBLIC_KEY_FILE: &str = "root_certificate.pem";

/// Returns the home directory, if it can be determined and is valid UTF-8.
pub fn home_dir() -> Option<Utf8PathBuf> {
    home::home_dir().and_then(|home| Utf8PathBuf::try_from(home).ok())
}

/// Returns the per-user SDC folder on Windows, `%APPDATA%\SDC11073`.
///
/// Always `None` on other platforms.
pub fn app_data_dir() -> Option<Utf8PathBuf> {
    #[cfg(windows)]
    {
        use etcetera::{BaseStrategy, base_strategy::Windows};

        let strategy = Windows::new().ok()?;
        Utf8PathBuf::try_from(strategy.config_dir().join("SDC11073")).ok()
    }

    #[cfg(not(windows))]
    None
}

/// Returns the folders searched for certificates, in order: `certs` in `cwd` and its two
/// ancestors, then `~/.sdc11073/certs`, then `certs` in `app_data` (see [`app_data_dir`]).
pub fn cert_folder_candidates(
    cwd: &Utf8Path,
    home: Option<&Utf8Path>,
    app_data: Option<&Utf8Path>,
) -> Vec<Utf8PathBuf> {
    let mut candidates: Vec<_> = cwd
        .ancestors()
        .take(3)
        .map(|dir| dir.join("certs"))
        .collect();
    if let Some(home) = home {
        candidates.push(home.join(".sdc11073").join("certs"));
    }
    if let Some(app_data) = app_data {
        candidates.push(app_data.join("certs"));
    }
    candidates
}

/// Returns the first candidate folder that exists.
pub fn discover_cert_folder(
    cwd: &Utf8Path,
    home: Option<&Utf8Path>,
    app_data: Option<&Utf8Path>,
) -> Result<Utf8PathBuf, TlsConfigError> {
    let candidates = cert_folder_candidates(cwd, home, app_data);
    match candidates.iter().find(|candidate| candidate.is_dir()) {
        Some(folder) => Ok(folder.clone()),
        None => Err(TlsConfigError::NoCertificateFolder {
            searched: candidates,
        }),
    }
}

/// Builds TLS material from `folder`, checking that every required file exists.
pub fn tls_material_from_folder(
    folder: &Utf8Path,
    passphrase: Option<String>,
) -> Result<TlsMaterial, TlsConfigError> {
    let missing: Vec<_> = [PRIVATE_KEY_FILE, CERTIFICATE_FILE, CA_PUBLIC_KEY_FILE]
        .into_iter()
        .filter(|name| !folder.join(name).is_file())
        .collect();
    if !missing.is_empty() {
        return Err(TlsConfigError::MissingFiles {
            folder: folder.to_owned(),
            missing,
        });
    }

    Ok(TlsMaterial {
        ca_folder: folder.to_owned(),
        private_key: folder.join(PRIVATE_KEY_FILE),
        certificate: folder.join(CERTIFICATE_FILE),
        ca_public_key: folder.join(CA_PUBLIC_KEY_FILE),
        passphrase,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn candidates_walk_up_then_home() {
        let candidates = cert_folder_candidates(
            Utf8Path::new("/work/repo/tests"),
            Some(Utf8Path::new("/home/user")),
            None,
        );
        assert_eq!(
            candidates,
            vec![
                Utf8PathBuf::from("/work/repo/tests/certs"),
                Utf8PathBuf::from("/work/repo/certs"),
                Utf8PathBuf::from("/work/certs"),
                Utf8PathBuf::from("/home/user/.sdc11073/certs"),
            ]
        );
    }

    #[test]
    fn app_data_is_searched_last() {
        let candidates = cert_folder_candidates(
            Utf8Path::new("/work"),
            Some(Utf8Path::new("/home/user")),
            Some(Utf8Path::new("/appdata/SDC11073")),
        );
        assert_eq!(
            candidates.last(),
            Some(&Utf8PathBuf::from("/appdata/SDC11073/certs"))
        );
        assert_eq!(candidates.len(), 4);
    }

    #[test]
    fn discovers_app_data_folder() {
        let dir = Utf8TempDir::new().unwrap();
        let app_data = dir.path().join("SDC11073");
        std::fs::create_dir_all(app_data.join("certs")).unwrap();

        assert_eq!(
            discover_cert_folder(&dir.path().join("a"), None, Some(&app_data)).unwrap(),
            app_data.join("certs")
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn no_app_data_outside_windows() {
        assert_eq!(app_data_dir(), None);
    }

    #[test]
    fn discovers_first_existing_folder() {
        let dir = Utf8TempDir::new().unwrap();
        let cwd = dir.path().join("a").join("b");
        std::fs::create_dir_all(&cwd).unwrap();
        std::fs::create_dir(dir.path().join("a").join("certs")).unwrap();

        assert_eq!(
            discover_cert_folder(&cwd, None, None).unwrap(),
            dir.path().join("a").join("certs")
        );

        let err = discover_cert_folder(&dir.path().join("elsewhere"), None, None).unwrap_err();
        assert!(matches!(err, TlsConfigError::NoCertificateFolder { .. }));
    }

    #[test]
    fn reports_missing_files() {
        let dir = Utf8TempDir::new().unwrap();
        std::fs::write(dir.path().join(PRIVATE_KEY_FILE), "key").unwrap();

        let err = tls_material_from_folder(dir.path(), None).unwrap_err();
        match err {
            TlsConfigError::MissingFiles { missing, .. } => {
                assert_eq!(missing, vec![CERTIFICATE_FILE, CA_PUBLIC_KEY_FILE]);
            }
            other => panic!("unexpected error: {other}"),
        }

        std::fs::write(dir.path().join(CERTIFICATE_FILE), "cert").unwrap();
        std::fs::write(dir.path().join(CA_PUBLIC_KEY_FILE), "root").unwrap();
        let material =
            tls_material_from_folder(dir.path(), Some(DUMMY_PASSPHRASE.to_owned())).unwrap();
        assert_eq!(material.private_key, dir.path().join(PRIVATE_KEY_FILE));
        assert_eq!(material.passphrase.as_deref(), Some(DUMMY_PASSPHRASE));
    }
}
