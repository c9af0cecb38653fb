use std::path::Path;

use sner_core::errors::SnerResult;
use sner_core::models::Assignment;
use sner_core::pidb::{ParsedHost, ParsedItemsDb};
use sner_core::traits::ParserModule;

use crate::file_from_zip;

/// Testing parser; registers every assignment target as a host.
pub struct DummyParser;

impl ParserModule for DummyParser {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn parse_path(&self, path: &Path) -> SnerResult<ParsedItemsDb> {
        let mut pidb = ParsedItemsDb::default();

        let assignment: Assignment =
            serde_json::from_slice(&file_from_zip(path, "assignment.json")?)?;
        for target in assignment.targets {
            pidb.upsert_host(ParsedHost::new(&target));
        }

        Ok(pidb)
    }
}
