//! Parsed-items database: the output of module parsers and the input of the
//! storage import step. Four collections keyed by stable handles; upserts
//! merge non-empty fields, concatenate list fields and never overwrite
//! existing data with nothing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::storage::{Host, Note, Service, Severity, Vuln};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedHost {
    pub address: String,
    pub hostname: Option<String>,
    pub hostnames: Vec<String>,
    pub os: Option<String>,
}

impl ParsedHost {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Default::default()
        }
    }

    fn update(&mut self, other: ParsedHost) {
        if other.hostname.is_some() {
            self.hostname = other.hostname;
        }
        for hostname in other.hostnames {
            if !self.hostnames.contains(&hostname) {
                self.hostnames.push(hostname);
            }
        }
        if other.os.is_some() {
            self.os = other.os;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedService {
    pub address: String,
    pub proto: String,
    pub port: i32,
    pub state: Option<String>,
    pub name: Option<String>,
    pub info: Option<String>,
    pub import_time: Option<DateTime<Utc>>,
}

impl ParsedService {
    pub fn new(address: &str, proto: &str, port: i32) -> Self {
        Self {
            address: address.to_string(),
            proto: proto.to_string(),
            port,
            state: None,
            name: None,
            info: None,
            import_time: None,
        }
    }

    fn update(&mut self, other: ParsedService) {
        if other.state.is_some() {
            self.state = other.state;
        }
        if other.name.is_some() {
            self.name = other.name;
        }
        if other.info.is_some() {
            self.info = other.info;
        }
        if other.import_time.is_some() {
            self.import_time = other.import_time;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedVuln {
    pub address: String,
    /// Service reference within the same pidb; None for host-level vulns.
    pub proto: Option<String>,
    pub port: Option<i32>,
    pub via_target: Option<String>,
    pub name: String,
    pub xtype: Option<String>,
    pub severity: Severity,
    pub descr: Option<String>,
    pub data: Option<String>,
    pub refs: Vec<String>,
    pub import_time: Option<DateTime<Utc>>,
}

impl ParsedVuln {
    pub fn new(address: &str, name: &str, xtype: Option<&str>) -> Self {
        Self {
            address: address.to_string(),
            proto: None,
            port: None,
            via_target: None,
            name: name.to_string(),
            xtype: xtype.map(str::to_string),
            severity: Severity::Unknown,
            descr: None,
            data: None,
            refs: Vec::new(),
            import_time: None,
        }
    }

    fn update(&mut self, other: ParsedVuln) {
        self.name = other.name;
        if other.severity != Severity::Unknown {
            self.severity = other.severity;
        }
        if other.descr.is_some() {
            self.descr = other.descr;
        }
        if other.data.is_some() {
            self.data = other.data;
        }
        for reference in other.refs {
            if !self.refs.contains(&reference) {
                self.refs.push(reference);
            }
        }
        if other.import_time.is_some() {
            self.import_time = other.import_time;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedNote {
    pub address: String,
    pub proto: Option<String>,
    pub port: Option<i32>,
    pub via_target: Option<String>,
    pub xtype: Option<String>,
    pub data: Option<String>,
    pub import_time: Option<DateTime<Utc>>,
}

impl ParsedNote {
    pub fn new(address: &str, xtype: Option<&str>, data: Option<&str>) -> Self {
        Self {
            address: address.to_string(),
            proto: None,
            port: None,
            via_target: None,
            xtype: xtype.map(str::to_string),
            data: data.map(str::to_string),
            import_time: None,
        }
    }

    fn update(&mut self, other: ParsedNote) {
        if other.data.is_some() {
            self.data = other.data;
        }
        if other.import_time.is_some() {
            self.import_time = other.import_time;
        }
    }
}

/// Service handle: (address, proto, port).
pub type ServiceKey = (String, String, i32);
/// Vuln/note handle: (address, service?, xtype, via_target?).
pub type ItemKey = (String, Option<(String, i32)>, Option<String>, Option<String>);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedItemsDb {
    pub hosts: BTreeMap<String, ParsedHost>,
    pub services: BTreeMap<ServiceKey, ParsedService>,
    pub vulns: BTreeMap<ItemKey, ParsedVuln>,
    pub notes: BTreeMap<ItemKey, ParsedNote>,
}

impl ParsedItemsDb {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
            && self.services.is_empty()
            && self.vulns.is_empty()
            && self.notes.is_empty()
    }

    pub fn upsert_host(&mut self, host: ParsedHost) {
        match self.hosts.get_mut(&host.address) {
            Some(existing) => existing.update(host),
            None => {
                self.hosts.insert(host.address.clone(), host);
            }
        }
    }

    pub fn upsert_service(&mut self, service: ParsedService) {
        // service always implies its host
        if !self.hosts.contains_key(&service.address) {
            self.upsert_host(ParsedHost::new(&service.address));
        }
        let key = (service.address.clone(), service.proto.clone(), service.port);
        match self.services.get_mut(&key) {
            Some(existing) => existing.update(service),
            None => {
                self.services.insert(key, service);
            }
        }
    }

    pub fn upsert_vuln(&mut self, vuln: ParsedVuln) {
        if !self.hosts.contains_key(&vuln.address) {
            self.upsert_host(ParsedHost::new(&vuln.address));
        }
        let key = (
            vuln.address.clone(),
            vuln.proto.clone().zip(vuln.port),
            vuln.xtype.clone(),
            vuln.via_target.clone(),
        );
        match self.vulns.get_mut(&key) {
            Some(existing) => existing.update(vuln),
            None => {
                self.vulns.insert(key, vuln);
            }
        }
    }

    pub fn upsert_note(&mut self, note: ParsedNote) {
        if !self.hosts.contains_key(&note.address) {
            self.upsert_host(ParsedHost::new(&note.address));
        }
        let key = (
            note.address.clone(),
            note.proto.clone().zip(note.port),
            note.xtype.clone(),
            note.via_target.clone(),
        );
        match self.notes.get_mut(&key) {
            Some(existing) => existing.update(note),
            None => {
                self.notes.insert(key, note);
            }
        }
    }

    /// Drop the listed addresses and everything referencing them.
    pub fn remove_addresses(&mut self, addresses: &std::collections::HashSet<String>) {
        self.hosts.retain(|address, _| !addresses.contains(address));
        self.services.retain(|key, _| !addresses.contains(&key.0));
        self.vulns.retain(|key, _| !addresses.contains(&key.0));
        self.notes.retain(|key, _| !addresses.contains(&key.0));
    }
}

impl Host {
    /// Merge parsed data; existing values are not overwritten with nothing.
    pub fn update_from(&mut self, parsed: &ParsedHost) {
        if parsed.hostname.is_some() {
            self.hostname = parsed.hostname.clone();
        }
        if parsed.os.is_some() {
            self.os = parsed.os.clone();
        }
    }
}

impl Service {
    pub fn update_from(&mut self, parsed: &ParsedService) {
        if parsed.state.is_some() {
            self.state = parsed.state.clone();
        }
        if parsed.name.is_some() {
            self.name = parsed.name.clone();
        }
        if parsed.info.is_some() {
            self.info = parsed.info.clone();
        }
        if parsed.import_time.is_some() {
            self.import_time = parsed.import_time;
        }
    }
}

impl Vuln {
    pub fn update_from(&mut self, parsed: &ParsedVuln) {
        self.name = parsed.name.clone();
        if parsed.severity != Severity::Unknown {
            self.severity = parsed.severity;
        }
        if parsed.descr.is_some() {
            self.descr = parsed.descr.clone();
        }
        if parsed.data.is_some() {
            self.data = parsed.data.clone();
        }
        for reference in &parsed.refs {
            if !self.refs.contains(reference) {
                self.refs.push(reference.clone());
            }
        }
        if parsed.import_time.is_some() {
            self.import_time = parsed.import_time;
        }
    }
}

impl Note {
    pub fn update_from(&mut self, parsed: &ParsedNote) {
        if parsed.data.is_some() {
            self.data = parsed.data.clone();
        }
        if parsed.import_time.is_some() {
            self.import_time = parsed.import_time;
        }
    }
}
