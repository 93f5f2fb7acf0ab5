//! Chaincode packaging in the external-builder archive format.
//!
//! The install package is a nested archive whose byte layout is a wire
//! contract with the peer lifecycle:
//!
//! - outer tar+gzip: `code.tar.gz` + `metadata.json`
//! - inner tar+gzip (`code.tar.gz`): `connection.json` + optional
//!   `META-INF/statedb/couchdb/indexes/*`

use crate::fabric::Error;
use flate2::{write::GzEncoder, Compression};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Chaincode type understood by the external builder
const PACKAGE_TYPE: &str = "external";

/// Where CouchDB index definitions live inside the code archive
const INDEXES_DIR: &str = "META-INF/statedb/couchdb/indexes";

/// Connection descriptor consumed by the external chaincode builder
#[derive(Serialize)]
struct Connection<'a> {
    address: &'a str,
    dial_timeout: &'a str,
    tls_required: bool,
    client_auth_required: bool,
}

/// Package metadata consumed by the peer lifecycle
#[derive(Serialize)]
struct Metadata<'a> {
    path: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    label: &'a str,
}

/// Describes one install package
pub struct PackageSpec<'a> {
    /// Package label, conventionally the chaincode name
    pub label: &'a str,
    /// Address the chaincode service listens on
    pub address: &'a str,
    /// Dial timeout in the `10s` form the builder expects
    pub dial_timeout: &'a str,
    /// Directory of CouchDB index definitions to bundle, if any
    pub indexes: Option<&'a Path>,
}

/// Writes the nested install archive into `dir` and returns its path
pub fn write_package(dir: &Path, spec: &PackageSpec) -> Result<PathBuf, Error> {
    // Inner archive: connection descriptor plus optional index definitions.
    let connection = serde_json::to_vec_pretty(&Connection {
        address: spec.address,
        dial_timeout: spec.dial_timeout,
        tls_required: false,
        client_auth_required: false,
    })?;
    let mut code = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    append_bytes(&mut code, "connection.json", &connection)?;
    if let Some(indexes) = spec.indexes {
        for entry in fs::read_dir(indexes)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let contents = fs::read(&path)?;
            append_bytes(&mut code, &format!("{INDEXES_DIR}/{file_name}"), &contents)?;
        }
    }
    let code = code
        .into_inner()
        .and_then(|gz| gz.finish())
        .map_err(Error::Io)?;

    // Outer archive: code archive plus package metadata.
    let metadata = serde_json::to_vec_pretty(&Metadata {
        path: "",
        kind: PACKAGE_TYPE,
        label: spec.label,
    })?;
    let mut package = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    append_bytes(&mut package, "code.tar.gz", &code)?;
    append_bytes(&mut package, "metadata.json", &metadata)?;
    let package = package
        .into_inner()
        .and_then(|gz| gz.finish())
        .map_err(Error::Io)?;

    let path = dir.join(format!("{}.tar.gz", spec.label));
    fs::write(&path, package)?;
    Ok(path)
}

fn append_bytes<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    contents: &[u8],
) -> Result<(), Error> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, contents)
        .map_err(Error::Io)
}
