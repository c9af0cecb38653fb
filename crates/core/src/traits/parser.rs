use std::path::Path;

use crate::errors::SnerResult;
use crate::pidb::ParsedItemsDb;

/// Parser for one module's job output archive.
pub trait ParserModule: Send + Sync {
    /// Registry key; equals the module name in queue configs.
    fn name(&self) -> &'static str;

    /// Parse a job output archive into a parsed-items database.
    fn parse_path(&self, path: &Path) -> SnerResult<ParsedItemsDb>;
}
