use std::path::Path;

use sner_core::errors::SnerResult;
use sner_core::pidb::{ParsedHost, ParsedItemsDb, ParsedNote, ParsedService};
use sner_core::traits::ParserModule;

use crate::file_from_zip;

/// Parses nmap greppable output (`output.gnmap` archive member) into
/// hosts, services and a hostnames note per named host.
pub struct NmapParser;

impl ParserModule for NmapParser {
    fn name(&self) -> &'static str {
        "nmap"
    }

    fn parse_path(&self, path: &Path) -> SnerResult<ParsedItemsDb> {
        let data = file_from_zip(path, "output.gnmap")?;
        Ok(parse_gnmap(&String::from_utf8_lossy(&data)))
    }
}

fn parse_gnmap(data: &str) -> ParsedItemsDb {
    let mut pidb = ParsedItemsDb::default();

    for line in data.lines() {
        let Some(rest) = line.strip_prefix("Host: ") else {
            continue;
        };

        let mut fields = rest.split('\t');
        let Some(hostspec) = fields.next() else {
            continue;
        };
        let mut hostspec_parts = hostspec.split_whitespace();
        let Some(address) = hostspec_parts.next() else {
            continue;
        };
        let hostname = hostspec_parts
            .next()
            .map(|part| part.trim_matches(|c| c == '(' || c == ')'))
            .filter(|name| !name.is_empty());

        let mut host = ParsedHost::new(address);
        if let Some(hostname) = hostname {
            host.hostname = Some(hostname.to_string());
            host.hostnames = vec![hostname.to_string()];
        }
        pidb.upsert_host(host);

        if let Some(hostname) = hostname {
            let data = serde_json::json!([hostname]).to_string();
            pidb.upsert_note(ParsedNote::new(address, Some("hostnames"), Some(&data)));
        }

        for field in fields {
            if let Some(ports) = field.strip_prefix("Ports: ") {
                for entry in ports.split(", ") {
                    if let Some(service) = parse_port_entry(address, entry) {
                        pidb.upsert_service(service);
                    }
                }
            }
        }
    }

    pidb
}

/// One gnmap ports entry: port/state/proto/owner/service/rpcinfo/version/
fn parse_port_entry(address: &str, entry: &str) -> Option<ParsedService> {
    let parts: Vec<&str> = entry.split('/').collect();
    if parts.len() < 5 {
        return None;
    }
    let port: i32 = parts[0].trim().parse().ok()?;
    let state = parts[1];
    let proto = parts[2];
    let name = parts[4];
    let version = parts.get(6).copied().unwrap_or("");

    let mut service = ParsedService::new(address, proto, port);
    service.state = Some(state.to_string());
    if !name.is_empty() {
        service.name = Some(name.to_string());
    }
    if !version.is_empty() {
        service.info = Some(version.to_string());
    }
    Some(service)
}
