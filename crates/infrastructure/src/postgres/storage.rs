use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use sner_core::errors::SnerResult;
use sner_core::filter::Filter;
use sner_core::models::storage::extract_version;
use sner_core::models::{
    Host, Note, NoteListItem, Service, ServiceListItem, StorageCounts, VersionInfo, Vuln,
};
use sner_core::netutils::format_host_address;
use sner_core::pidb::ParsedItemsDb;
use sner_core::traits::StorageRepository;

use crate::filter_sql::{push_filter, ColumnMap};

use super::QUERY_WINDOW;

pub struct PgStorageRepository {
    pool: PgPool,
}

impl PgStorageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn host_columns() -> ColumnMap {
        ColumnMap::new(vec![
            (("Host", "address"), "host.address"),
            (("Host", "hostname"), "host.hostname"),
            (("Host", "os"), "host.os"),
            (("Host", "tags"), "host.tags"),
            (("Host", "comment"), "host.comment"),
        ])
    }

    fn service_columns() -> ColumnMap {
        ColumnMap::new(vec![
            (("Host", "address"), "h.address"),
            (("Host", "hostname"), "h.hostname"),
            (("Service", "proto"), "s.proto"),
            (("Service", "port"), "s.port"),
            (("Service", "state"), "s.state"),
            (("Service", "name"), "s.name"),
            (("Service", "info"), "s.info"),
            (("Service", "tags"), "s.tags"),
        ])
    }

    fn note_columns() -> ColumnMap {
        ColumnMap::new(vec![
            (("Host", "address"), "h.address"),
            (("Host", "hostname"), "h.hostname"),
            (("Note", "xtype"), "n.xtype"),
            (("Note", "data"), "n.data"),
            (("Note", "via_target"), "n.via_target"),
            (("Note", "tags"), "n.tags"),
        ])
    }

    fn versioninfo_columns() -> ColumnMap {
        ColumnMap::new(vec![
            (("Versioninfo", "host_address"), "host_address"),
            (("Versioninfo", "host_hostname"), "host_hostname"),
            (("Versioninfo", "service_proto"), "service_proto"),
            (("Versioninfo", "service_port"), "service_port"),
            (("Versioninfo", "product"), "product"),
            (("Versioninfo", "version"), "version"),
            (("Versioninfo", "extra"), "extra"),
        ])
    }
}

/// Append the caller's api_networks restriction on an address expression.
fn push_networks(builder: &mut QueryBuilder<'_, Postgres>, column: &str, networks: &[String]) {
    builder
        .push(format!("{column}::inet <<= ANY(("))
        .push_bind(networks.to_vec())
        .push("::text[])::inet[])");
}

#[async_trait]
impl StorageRepository for PgStorageRepository {
    async fn import_pidb(&self, pidb: &ParsedItemsDb) -> SnerResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for parsed in pidb.hosts.values() {
            let existing = sqlx::query_as::<_, Host>(
                "SELECT id, address, hostname, os, tags, comment, created, modified, rescan_time \
                 FROM host WHERE address = $1",
            )
            .bind(&parsed.address)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(mut host) => {
                    host.update_from(parsed);
                    sqlx::query(
                        "UPDATE host SET hostname = $2, os = $3, modified = $4 WHERE id = $1",
                    )
                    .bind(host.id)
                    .bind(&host.hostname)
                    .bind(&host.os)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query("INSERT INTO host (address, hostname, os) VALUES ($1, $2, $3)")
                        .bind(&parsed.address)
                        .bind(&parsed.hostname)
                        .bind(&parsed.os)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        for parsed in pidb.services.values() {
            let (host_id,): (i64,) = sqlx::query_as("SELECT id FROM host WHERE address = $1")
                .bind(&parsed.address)
                .fetch_one(&mut *tx)
                .await?;

            let existing = sqlx::query_as::<_, Service>(
                "SELECT id, host_id, proto, port, state, name, info, tags, comment, created, \
                        modified, rescan_time, import_time \
                 FROM service WHERE host_id = $1 AND proto = $2 AND port = $3",
            )
            .bind(host_id)
            .bind(&parsed.proto)
            .bind(parsed.port)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(mut service) => {
                    service.update_from(parsed);
                    sqlx::query(
                        "UPDATE service SET state = $2, name = $3, info = $4, import_time = $5, \
                                modified = $6 WHERE id = $1",
                    )
                    .bind(service.id)
                    .bind(&service.state)
                    .bind(&service.name)
                    .bind(&service.info)
                    .bind(service.import_time)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO service (host_id, proto, port, state, name, info, import_time) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    )
                    .bind(host_id)
                    .bind(&parsed.proto)
                    .bind(parsed.port)
                    .bind(&parsed.state)
                    .bind(&parsed.name)
                    .bind(&parsed.info)
                    .bind(parsed.import_time)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        for parsed in pidb.vulns.values() {
            let (host_id,): (i64,) = sqlx::query_as("SELECT id FROM host WHERE address = $1")
                .bind(&parsed.address)
                .fetch_one(&mut *tx)
                .await?;
            let service_id = match parsed.proto.as_ref().zip(parsed.port) {
                Some((proto, port)) => sqlx::query_as::<_, (i64,)>(
                    "SELECT id FROM service WHERE host_id = $1 AND proto = $2 AND port = $3",
                )
                .bind(host_id)
                .bind(proto)
                .bind(port)
                .fetch_optional(&mut *tx)
                .await?
                .map(|(id,)| id),
                None => None,
            };

            let existing = sqlx::query_as::<_, Vuln>(
                "SELECT id, host_id, service_id, via_target, name, xtype, severity, descr, data, \
                        refs, tags, comment, created, modified, rescan_time, import_time \
                 FROM vuln WHERE host_id = $1 AND service_id IS NOT DISTINCT FROM $2 \
                   AND xtype IS NOT DISTINCT FROM $3 AND via_target IS NOT DISTINCT FROM $4",
            )
            .bind(host_id)
            .bind(service_id)
            .bind(&parsed.xtype)
            .bind(&parsed.via_target)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(mut vuln) => {
                    vuln.update_from(parsed);
                    sqlx::query(
                        "UPDATE vuln SET name = $2, severity = $3, descr = $4, data = $5, \
                                refs = $6, import_time = $7, modified = $8 WHERE id = $1",
                    )
                    .bind(vuln.id)
                    .bind(&vuln.name)
                    .bind(vuln.severity)
                    .bind(&vuln.descr)
                    .bind(&vuln.data)
                    .bind(&vuln.refs)
                    .bind(vuln.import_time)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO vuln (host_id, service_id, via_target, name, xtype, severity, \
                                descr, data, refs, import_time) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                    )
                    .bind(host_id)
                    .bind(service_id)
                    .bind(&parsed.via_target)
                    .bind(&parsed.name)
                    .bind(&parsed.xtype)
                    .bind(parsed.severity)
                    .bind(&parsed.descr)
                    .bind(&parsed.data)
                    .bind(&parsed.refs)
                    .bind(parsed.import_time)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        for parsed in pidb.notes.values() {
            let (host_id,): (i64,) = sqlx::query_as("SELECT id FROM host WHERE address = $1")
                .bind(&parsed.address)
                .fetch_one(&mut *tx)
                .await?;
            let service_id = match parsed.proto.as_ref().zip(parsed.port) {
                Some((proto, port)) => sqlx::query_as::<_, (i64,)>(
                    "SELECT id FROM service WHERE host_id = $1 AND proto = $2 AND port = $3",
                )
                .bind(host_id)
                .bind(proto)
                .bind(port)
                .fetch_optional(&mut *tx)
                .await?
                .map(|(id,)| id),
                None => None,
            };

            let existing = sqlx::query_as::<_, Note>(
                "SELECT id, host_id, service_id, via_target, xtype, data, tags, comment, created, \
                        modified, import_time \
                 FROM note WHERE host_id = $1 AND service_id IS NOT DISTINCT FROM $2 \
                   AND xtype IS NOT DISTINCT FROM $3 AND via_target IS NOT DISTINCT FROM $4",
            )
            .bind(host_id)
            .bind(service_id)
            .bind(&parsed.xtype)
            .bind(&parsed.via_target)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(mut note) => {
                    note.update_from(parsed);
                    sqlx::query(
                        "UPDATE note SET data = $2, import_time = $3, modified = $4 WHERE id = $1",
                    )
                    .bind(note.id)
                    .bind(&note.data)
                    .bind(note.import_time)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO note (host_id, service_id, via_target, xtype, data, import_time) \
                         VALUES ($1, $2, $3, $4, $5, $6)",
                    )
                    .bind(host_id)
                    .bind(service_id)
                    .bind(&parsed.via_target)
                    .bind(&parsed.xtype)
                    .bind(&parsed.data)
                    .bind(parsed.import_time)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn cleanup_storage(&self) -> SnerResult<()> {
        let mut tx = self.pool.begin().await?;

        // non-open services; vulns and notes cascade via foreign keys
        let services = sqlx::query(
            "DELETE FROM service WHERE state IS NULL OR NOT (state ILIKE 'open%')",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // hosts without identifying attributes and without child rows; a
        // lone hostnames note does not keep a host alive
        let hosts = sqlx::query(
            "DELETE FROM host h \
             WHERE coalesce(h.os, '') = '' AND coalesce(h.comment, '') = '' \
               AND NOT EXISTS (SELECT 1 FROM service s WHERE s.host_id = h.id) \
               AND NOT EXISTS (SELECT 1 FROM vuln v WHERE v.host_id = h.id) \
               AND ( \
                 NOT EXISTS (SELECT 1 FROM note n WHERE n.host_id = h.id) \
                 OR ( \
                   (SELECT count(*) FROM note n WHERE n.host_id = h.id) = 1 \
                   AND EXISTS (SELECT 1 FROM note n WHERE n.host_id = h.id AND n.xtype = 'hostnames') \
                 ) \
               )",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        debug!("storage cleanup removed {} services, {} hosts", services, hosts);
        Ok(())
    }

    async fn rescan_services(
        &self,
        horizon: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SnerResult<Vec<String>> {
        let mut rescan = Vec::new();
        let mut ids = Vec::new();
        let mut last_id = 0i64;
        loop {
            let rows: Vec<(i64, String, i32, String)> = sqlx::query_as(
                "SELECT s.id, s.proto, s.port, h.address FROM service s \
                 JOIN host h ON h.id = s.host_id \
                 WHERE s.rescan_time < $1 AND s.id > $2 ORDER BY s.id LIMIT $3",
            )
            .bind(horizon)
            .bind(last_id)
            .bind(QUERY_WINDOW)
            .fetch_all(&self.pool)
            .await?;
            let Some((id, _, _, _)) = rows.last() else {
                break;
            };
            last_id = *id;
            for (id, proto, port, address) in rows {
                rescan.push(format!("{proto}://{}:{port}", format_host_address(&address)));
                ids.push(id);
            }
        }

        // orm-less bulk stamp, large rescans are frequent
        if !ids.is_empty() {
            sqlx::query("UPDATE service SET rescan_time = $1 WHERE id = ANY($2)")
                .bind(now)
                .bind(&ids)
                .execute(&self.pool)
                .await?;
        }
        Ok(rescan)
    }

    async fn rescan_hosts(
        &self,
        horizon: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SnerResult<Vec<String>> {
        let mut rescan = Vec::new();
        let mut ids = Vec::new();
        let mut last_id = 0i64;
        loop {
            let rows: Vec<(i64, String)> = sqlx::query_as(
                "SELECT id, address FROM host \
                 WHERE rescan_time < $1 AND id > $2 ORDER BY id LIMIT $3",
            )
            .bind(horizon)
            .bind(last_id)
            .bind(QUERY_WINDOW)
            .fetch_all(&self.pool)
            .await?;
            let Some((id, _)) = rows.last() else {
                break;
            };
            last_id = *id;
            for (id, address) in rows {
                rescan.push(address);
                ids.push(id);
            }
        }

        if !ids.is_empty() {
            sqlx::query("UPDATE host SET rescan_time = $1 WHERE id = ANY($2)")
                .bind(now)
                .bind(&ids)
                .execute(&self.pool)
                .await?;
        }
        Ok(rescan)
    }

    async fn six_addresses(&self) -> SnerResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT address FROM host WHERE address LIKE '%:%' ORDER BY address")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(address,)| address).collect())
    }

    async fn get_host(&self, address: &str) -> SnerResult<Option<Host>> {
        let host = sqlx::query_as::<_, Host>(
            "SELECT id, address, hostname, os, tags, comment, created, modified, rescan_time \
             FROM host WHERE address = $1",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(host)
    }

    async fn query_hosts(
        &self,
        filter: Option<&Filter>,
        networks: &[String],
    ) -> SnerResult<Vec<Host>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, address, hostname, os, tags, comment, created, modified, rescan_time \
             FROM host WHERE ",
        );
        push_networks(&mut builder, "host.address", networks);
        if let Some(filter) = filter {
            builder.push(" AND ");
            push_filter(&mut builder, filter, &Self::host_columns())?;
        }
        builder.push(" ORDER BY host.address");

        let hosts = builder.build_query_as::<Host>().fetch_all(&self.pool).await?;
        Ok(hosts)
    }

    async fn query_services(
        &self,
        filter: Option<&Filter>,
        networks: &[String],
    ) -> SnerResult<Vec<ServiceListItem>> {
        let mut builder = QueryBuilder::new(
            "SELECT h.address, h.hostname, s.proto, s.port, s.state, s.name, s.info \
             FROM service s JOIN host h ON h.id = s.host_id WHERE ",
        );
        push_networks(&mut builder, "h.address", networks);
        if let Some(filter) = filter {
            builder.push(" AND ");
            push_filter(&mut builder, filter, &Self::service_columns())?;
        }
        builder.push(" ORDER BY h.address, s.proto, s.port");

        let services = builder
            .build_query_as::<ServiceListItem>()
            .fetch_all(&self.pool)
            .await?;
        Ok(services)
    }

    async fn query_notes(
        &self,
        filter: Option<&Filter>,
        networks: &[String],
    ) -> SnerResult<Vec<NoteListItem>> {
        let mut builder = QueryBuilder::new(
            "SELECT h.address, h.hostname, s.proto, s.port, n.via_target, n.xtype, n.data \
             FROM note n JOIN host h ON h.id = n.host_id \
             LEFT JOIN service s ON s.id = n.service_id WHERE ",
        );
        push_networks(&mut builder, "h.address", networks);
        if let Some(filter) = filter {
            builder.push(" AND ");
            push_filter(&mut builder, filter, &Self::note_columns())?;
        }
        builder.push(" ORDER BY h.address, n.id");

        let notes = builder
            .build_query_as::<NoteListItem>()
            .fetch_all(&self.pool)
            .await?;
        Ok(notes)
    }

    async fn query_versioninfo(
        &self,
        filter: Option<&Filter>,
        networks: &[String],
    ) -> SnerResult<Vec<VersionInfo>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, host_id, host_address, host_hostname, service_proto, service_port, \
                    via_target, product, version, extra \
             FROM version_info WHERE ",
        );
        push_networks(&mut builder, "host_address", networks);
        if let Some(filter) = filter {
            builder.push(" AND ");
            push_filter(&mut builder, filter, &Self::versioninfo_columns())?;
        }
        builder.push(" ORDER BY host_address, service_port");

        let infos = builder
            .build_query_as::<VersionInfo>()
            .fetch_all(&self.pool)
            .await?;
        Ok(infos)
    }

    async fn rebuild_versioninfo(&self) -> SnerResult<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM version_info").execute(&mut *tx).await?;

        let mut count = 0u64;
        let mut last_id = 0i64;
        loop {
            let rows: Vec<(i64, String, i32, Option<String>, i64, String, Option<String>)> =
                sqlx::query_as(
                    "SELECT s.id, s.proto, s.port, s.info, h.id, h.address, h.hostname \
                     FROM service s JOIN host h ON h.id = s.host_id \
                     WHERE s.info IS NOT NULL AND s.id > $1 ORDER BY s.id LIMIT $2",
                )
                .bind(last_id)
                .bind(QUERY_WINDOW)
                .fetch_all(&mut *tx)
                .await?;
            let Some((id, ..)) = rows.last() else {
                break;
            };
            last_id = *id;

            for (_, proto, port, info, host_id, address, hostname) in rows {
                let Some((product, version)) =
                    info.as_deref().and_then(extract_version)
                else {
                    continue;
                };
                sqlx::query(
                    "INSERT INTO version_info \
                     (host_id, host_address, host_hostname, service_proto, service_port, \
                      product, version, extra) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, '{}')",
                )
                .bind(host_id)
                .bind(&address)
                .bind(&hostname)
                .bind(&proto)
                .bind(port)
                .bind(&product)
                .bind(&version)
                .execute(&mut *tx)
                .await?;
                count += 1;
            }
        }

        tx.commit().await?;
        debug!("versioninfo rebuilt, {} rows", count);
        Ok(count)
    }

    async fn counts(&self) -> SnerResult<StorageCounts> {
        let (hosts, services, vulns, notes): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT count(*) FROM host), (SELECT count(*) FROM service), \
                    (SELECT count(*) FROM vuln), (SELECT count(*) FROM note)",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StorageCounts {
            hosts,
            services,
            vulns,
            notes,
        })
    }
}
