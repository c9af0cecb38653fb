//! Parsers turning uploaded job output archives into parsed-items
//! databases. Keyed by module name; the registry is populated at startup,
//! no dynamic loading.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use sner_core::errors::{SnerError, SnerResult};
use sner_core::traits::ParserModule;

mod dummy;
mod nmap;

pub use dummy::DummyParser;
pub use nmap::NmapParser;

static REGISTRY: OnceLock<HashMap<&'static str, Box<dyn ParserModule>>> = OnceLock::new();

/// Module name → parser map.
pub fn registered_parsers() -> &'static HashMap<&'static str, Box<dyn ParserModule>> {
    REGISTRY.get_or_init(|| {
        let parsers: Vec<Box<dyn ParserModule>> =
            vec![Box::new(DummyParser), Box::new(NmapParser)];
        parsers
            .into_iter()
            .map(|parser| (parser.name(), parser))
            .collect()
    })
}

pub fn get_parser(name: &str) -> SnerResult<&'static dyn ParserModule> {
    registered_parsers()
        .get(name)
        .map(|parser| parser.as_ref())
        .ok_or_else(|| SnerError::NotFound(format!("parser {name}")))
}

/// Read a single member from a job output zip archive.
pub fn file_from_zip(path: &Path, member: &str) -> SnerResult<Vec<u8>> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|err| SnerError::Parse(format!("invalid archive {}: {err}", path.display())))?;
    let mut member = archive
        .by_name(member)
        .map_err(|err| SnerError::Parse(format!("missing archive member {member}: {err}")))?;
    let mut data = Vec::new();
    member.read_to_end(&mut data)?;
    Ok(data)
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::io::Write;
    use std::path::PathBuf;

    use zip::write::SimpleFileOptions;

    /// Write a zip archive with the given members into `dir`.
    pub fn write_zip(dir: &std::path::Path, members: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("output.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut archive = zip::ZipWriter::new(file);
        for (name, data) in members {
            archive
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            archive.write_all(data).unwrap();
        }
        archive.finish().unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_parsers() {
        assert!(get_parser("dummy").is_ok());
        assert!(get_parser("nmap").is_ok());
        assert!(get_parser("nonexistent").is_err());
    }

    #[test]
    fn file_from_zip_reads_member() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_utils::write_zip(dir.path(), &[("hello.txt", b"payload")]);

        assert_eq!(file_from_zip(&path, "hello.txt").unwrap(), b"payload");
        assert!(file_from_zip(&path, "other.txt").is_err());
    }
}
