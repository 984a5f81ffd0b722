// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, ToSql, params};
use tracing::{debug, info};

use super::{DEFAULT_MAX_FAILED_MOUNT_ATTEMPTS, DynaKube, Error, HostVolume, Volume};

const CREATE_DYNAKUBES: &str = "CREATE TABLE IF NOT EXISTS dynakubes (
    Name VARCHAR NOT NULL,
    TenantUUID VARCHAR NOT NULL,
    LatestVersion VARCHAR NOT NULL,
    PRIMARY KEY (Name)
)";

const CREATE_VOLUMES: &str = "CREATE TABLE IF NOT EXISTS volumes (
    ID VARCHAR NOT NULL,
    PodName VARCHAR NOT NULL,
    Version VARCHAR NOT NULL,
    TenantUUID VARCHAR NOT NULL,
    PRIMARY KEY (ID)
)";

const CREATE_HOST_VOLUMES: &str = "CREATE TABLE IF NOT EXISTS osagent_volumes (
    TenantUUID VARCHAR NOT NULL,
    VolumeID VARCHAR NOT NULL,
    Mounted BOOLEAN NOT NULL,
    LastModified DATETIME NOT NULL,
    PRIMARY KEY (TenantUUID)
)";

// Columns added after the first release. Applied on every open; "duplicate column" is expected.
fn column_migrations() -> [String; 4] {
    [
        "ALTER TABLE dynakubes ADD COLUMN ImageDigest VARCHAR NOT NULL DEFAULT ''".to_string(),
        format!(
            "ALTER TABLE dynakubes ADD COLUMN MaxFailedMountAttempts INT NOT NULL DEFAULT {DEFAULT_MAX_FAILED_MOUNT_ATTEMPTS}"
        ),
        "ALTER TABLE volumes ADD COLUMN MountAttempts INT NOT NULL DEFAULT 0".to_string(),
        "ALTER TABLE volumes ADD COLUMN PodNamespace VARCHAR NOT NULL DEFAULT ''".to_string(),
    ]
}

/// Store is the sqlite backed metadata database. Each method runs as one statement or
/// transaction; the connection mutex serializes callers.
pub struct Store {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

fn query_err(op: &'static str) -> impl FnOnce(rusqlite::Error) -> Error {
    move |e| Error::Query(op, e)
}

fn is_duplicate_column(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, msg) => {
            err.code == ErrorCode::Unknown
                && msg
                    .as_deref()
                    .is_some_and(|m| m.contains("duplicate column"))
        }
        _ => false,
    }
}

impl Store {
    pub fn open(path: &Path) -> Result<Store, Error> {
        let conn = Connection::open(path).map_err(|e| Error::Open(path.to_path_buf(), e))?;
        let store = Store::setup(conn)?;
        info!(path=%path.display(), "opened metadata store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Store, Error> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Open(":memory:".into(), e))?;
        Store::setup(conn)
    }

    fn setup(conn: Connection) -> Result<Store, Error> {
        for stmt in [CREATE_DYNAKUBES, CREATE_VOLUMES, CREATE_HOST_VOLUMES] {
            conn.execute(stmt, []).map_err(query_err("create table"))?;
        }
        for stmt in column_migrations() {
            match conn.execute(&stmt, []) {
                Ok(_) => debug!("applied migration: {stmt}"),
                Err(e) if is_duplicate_column(&e) => {}
                Err(e) => return Err(Error::Query("migrate schema", e)),
            }
        }
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_dynakube(&self, dk: &DynaKube) -> Result<(), Error> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO dynakubes (Name, TenantUUID, LatestVersion, ImageDigest, MaxFailedMountAttempts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    dk.name,
                    dk.tenant_uuid,
                    dk.latest_version,
                    dk.image_digest,
                    dk.max_failed_mount_attempts
                ],
            )
            .map_err(query_err("insert dynakube"))?;
        Ok(())
    }

    pub fn update_dynakube(&self, dk: &DynaKube) -> Result<(), Error> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE dynakubes
                 SET LatestVersion = ?1, TenantUUID = ?2, ImageDigest = ?3, MaxFailedMountAttempts = ?4
                 WHERE Name = ?5",
                params![
                    dk.latest_version,
                    dk.tenant_uuid,
                    dk.image_digest,
                    dk.max_failed_mount_attempts,
                    dk.name
                ],
            )
            .map_err(query_err("update dynakube"))?;
        Ok(())
    }

    pub fn delete_dynakube(&self, name: &str) -> Result<(), Error> {
        self.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM dynakubes WHERE Name = ?1", params![name])
            .map_err(query_err("delete dynakube"))?;
        Ok(())
    }

    pub fn get_dynakube(&self, name: &str) -> Result<Option<DynaKube>, Error> {
        self.conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT Name, TenantUUID, LatestVersion, ImageDigest, MaxFailedMountAttempts
                 FROM dynakubes WHERE Name = ?1",
                params![name],
                dynakube_from_row,
            )
            .optional()
            .map_err(query_err("get dynakube"))
    }

    pub fn get_all_dynakubes(&self) -> Result<Vec<DynaKube>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT Name, TenantUUID, LatestVersion, ImageDigest, MaxFailedMountAttempts
                 FROM dynakubes",
            )
            .map_err(query_err("list dynakubes"))?;
        let rows = stmt
            .query_map([], dynakube_from_row)
            .map_err(query_err("list dynakubes"))?;
        rows.collect::<Result<_, _>>()
            .map_err(query_err("list dynakubes"))
    }

    /// DynaKube name to tenant UUID.
    pub fn get_tenants_to_dynakubes(&self) -> Result<HashMap<String, String>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT Name, TenantUUID FROM dynakubes")
            .map_err(query_err("list tenants"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(query_err("list tenants"))?;
        rows.collect::<Result<_, _>>()
            .map_err(query_err("list tenants"))
    }

    /// Inserts the volume or replaces the record with the same ID.
    pub fn insert_volume(&self, v: &Volume) -> Result<(), Error> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO volumes (ID, PodName, Version, TenantUUID, MountAttempts, PodNamespace)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (ID) DO UPDATE SET
                   PodName = excluded.PodName,
                   PodNamespace = excluded.PodNamespace,
                   Version = excluded.Version,
                   TenantUUID = excluded.TenantUUID,
                   MountAttempts = excluded.MountAttempts",
                params![
                    v.volume_id,
                    v.pod_name,
                    v.version,
                    v.tenant_uuid,
                    v.mount_attempts,
                    v.pod_namespace
                ],
            )
            .map_err(query_err("insert volume"))?;
        Ok(())
    }

    pub fn delete_volume(&self, volume_id: &str) -> Result<(), Error> {
        self.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM volumes WHERE ID = ?1", params![volume_id])
            .map_err(query_err("delete volume"))?;
        Ok(())
    }

    pub fn get_volume(&self, volume_id: &str) -> Result<Option<Volume>, Error> {
        self.conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT ID, PodName, Version, TenantUUID, MountAttempts, PodNamespace FROM volumes WHERE ID = ?1",
                params![volume_id],
                volume_from_row,
            )
            .optional()
            .map_err(query_err("get volume"))
    }

    pub fn get_all_volumes(&self) -> Result<Vec<Volume>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT ID, PodName, Version, TenantUUID, MountAttempts, PodNamespace FROM volumes")
            .map_err(query_err("list volumes"))?;
        let rows = stmt
            .query_map([], volume_from_row)
            .map_err(query_err("list volumes"))?;
        rows.collect::<Result<_, _>>()
            .map_err(query_err("list volumes"))
    }

    /// Pod name to volume ID.
    pub fn get_pod_names(&self) -> Result<HashMap<String, String>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT PodName, ID FROM volumes")
            .map_err(query_err("list pod names"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(query_err("list pod names"))?;
        rows.collect::<Result<_, _>>()
            .map_err(query_err("list pod names"))
    }

    pub fn get_used_versions(&self, tenant_uuid: &str) -> Result<HashSet<String>, Error> {
        self.string_set(
            "SELECT DISTINCT Version FROM volumes WHERE TenantUUID = ?1",
            Some(tenant_uuid),
            "list used versions",
        )
    }

    pub fn get_all_used_versions(&self) -> Result<HashSet<String>, Error> {
        self.string_set(
            "SELECT DISTINCT Version FROM volumes",
            None,
            "list used versions",
        )
    }

    pub fn get_used_image_digests(&self) -> Result<HashSet<String>, Error> {
        self.string_set(
            "SELECT DISTINCT ImageDigest FROM dynakubes WHERE ImageDigest != ''",
            None,
            "list image digests",
        )
    }

    fn string_set(
        &self,
        sql: &str,
        arg: Option<&str>,
        op: &'static str,
    ) -> Result<HashSet<String>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql).map_err(query_err(op))?;
        let args: Vec<&dyn ToSql> = arg.iter().map(|a| a as &dyn ToSql).collect();
        let rows = stmt
            .query_map(args.as_slice(), |row| row.get(0))
            .map_err(query_err(op))?;
        rows.collect::<Result<_, _>>().map_err(query_err(op))
    }

    pub fn insert_host_volume(&self, v: &HostVolume) -> Result<(), Error> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO osagent_volumes (TenantUUID, VolumeID, Mounted, LastModified)
                 VALUES (?1, ?2, ?3, ?4)",
                params![v.tenant_uuid, v.volume_id, v.mounted, v.last_modified],
            )
            .map_err(query_err("insert host volume"))?;
        Ok(())
    }

    pub fn update_host_volume(&self, v: &HostVolume) -> Result<(), Error> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE osagent_volumes SET VolumeID = ?1, Mounted = ?2, LastModified = ?3
                 WHERE TenantUUID = ?4",
                params![v.volume_id, v.mounted, v.last_modified, v.tenant_uuid],
            )
            .map_err(query_err("update host volume"))?;
        Ok(())
    }

    pub fn get_host_volume_by_volume_id(&self, volume_id: &str) -> Result<Option<HostVolume>, Error> {
        self.conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT TenantUUID, VolumeID, Mounted, LastModified FROM osagent_volumes WHERE VolumeID = ?1",
                params![volume_id],
                host_volume_from_row,
            )
            .optional()
            .map_err(query_err("get host volume"))
    }

    pub fn get_host_volume_by_tenant_uuid(
        &self,
        tenant_uuid: &str,
    ) -> Result<Option<HostVolume>, Error> {
        self.conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT TenantUUID, VolumeID, Mounted, LastModified FROM osagent_volumes WHERE TenantUUID = ?1",
                params![tenant_uuid],
                host_volume_from_row,
            )
            .optional()
            .map_err(query_err("get host volume"))
    }

    pub fn get_all_host_volumes(&self) -> Result<Vec<HostVolume>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT TenantUUID, VolumeID, Mounted, LastModified FROM osagent_volumes")
            .map_err(query_err("list host volumes"))?;
        let rows = stmt
            .query_map([], host_volume_from_row)
            .map_err(query_err("list host volumes"))?;
        rows.collect::<Result<_, _>>()
            .map_err(query_err("list host volumes"))
    }
}

fn dynakube_from_row(row: &Row<'_>) -> rusqlite::Result<DynaKube> {
    Ok(DynaKube {
        name: row.get(0)?,
        tenant_uuid: row.get(1)?,
        latest_version: row.get(2)?,
        image_digest: row.get(3)?,
        max_failed_mount_attempts: row.get(4)?,
    })
}

fn volume_from_row(row: &Row<'_>) -> rusqlite::Result<Volume> {
    Ok(Volume {
        volume_id: row.get(0)?,
        pod_name: row.get(1)?,
        version: row.get(2)?,
        tenant_uuid: row.get(3)?,
        mount_attempts: row.get(4)?,
        pod_namespace: row.get(5)?,
    })
}

fn host_volume_from_row(row: &Row<'_>) -> rusqlite::Result<HostVolume> {
    Ok(HostVolume {
        tenant_uuid: row.get(0)?,
        volume_id: row.get(1)?,
        mounted: row.get(2)?,
        last_modified: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn volume(id: &str, pod: &str, version: &str, tenant: &str) -> Volume {
        Volume {
            volume_id: id.to_string(),
            pod_name: pod.to_string(),
            pod_namespace: "ns".to_string(),
            version: version.to_string(),
            tenant_uuid: tenant.to_string(),
            mount_attempts: 0,
        }
    }

    #[test]
    fn dynakube_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let mut dk = DynaKube::new("dk", "t1");
        dk.latest_version = "1.2-3".to_string();
        store.insert_dynakube(&dk).unwrap();
        assert_eq!(store.get_dynakube("dk").unwrap(), Some(dk.clone()));

        dk.latest_version = String::new();
        dk.image_digest = "abc".to_string();
        dk.max_failed_mount_attempts = 5;
        store.update_dynakube(&dk).unwrap();
        assert_eq!(store.get_dynakube("dk").unwrap(), Some(dk));
        assert_eq!(
            store.get_used_image_digests().unwrap(),
            HashSet::from(["abc".to_string()])
        );
        assert_eq!(
            store.get_tenants_to_dynakubes().unwrap(),
            HashMap::from([("dk".to_string(), "t1".to_string())])
        );

        store.delete_dynakube("dk").unwrap();
        assert_eq!(store.get_dynakube("dk").unwrap(), None);
        assert!(store.get_all_dynakubes().unwrap().is_empty());
    }

    #[test]
    fn missing_rows_are_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_dynakube("nope").unwrap().is_none());
        assert!(store.get_volume("nope").unwrap().is_none());
        assert!(store.get_host_volume_by_volume_id("nope").unwrap().is_none());
        assert!(store.get_host_volume_by_tenant_uuid("nope").unwrap().is_none());
    }

    #[test]
    fn volume_upsert_and_queries() {
        let store = Store::open_in_memory().unwrap();
        let mut v1 = volume("v1", "p1", "", "t1");
        v1.mount_attempts = 1;
        store.insert_volume(&v1).unwrap();
        v1.version = "1.2-3".to_string();
        v1.mount_attempts = 0;
        store.insert_volume(&v1).unwrap();
        store.insert_volume(&volume("v2", "p2", "1.2-4", "t2")).unwrap();

        assert_eq!(store.get_volume("v1").unwrap(), Some(v1));
        assert_eq!(store.get_all_volumes().unwrap().len(), 2);
        assert_eq!(
            store.get_used_versions("t1").unwrap(),
            HashSet::from(["1.2-3".to_string()])
        );
        assert_eq!(store.get_all_used_versions().unwrap().len(), 2);
        assert_eq!(
            store.get_pod_names().unwrap().get("p2").map(String::as_str),
            Some("v2")
        );

        store.delete_volume("v1").unwrap();
        store.delete_volume("v1").unwrap();
        assert!(store.get_volume("v1").unwrap().is_none());
    }

    #[test]
    fn host_volume_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let mut hv = HostVolume {
            tenant_uuid: "t1".to_string(),
            volume_id: "h1".to_string(),
            mounted: true,
            last_modified: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        };
        store.insert_host_volume(&hv).unwrap();
        hv.mounted = false;
        store.update_host_volume(&hv).unwrap();
        assert_eq!(store.get_host_volume_by_volume_id("h1").unwrap(), Some(hv.clone()));
        assert_eq!(store.get_host_volume_by_tenant_uuid("t1").unwrap(), Some(hv));
        assert_eq!(store.get_all_host_volumes().unwrap().len(), 1);
    }

    #[test]
    fn reopen_keeps_data_and_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("csi.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(CREATE_DYNAKUBES, []).unwrap();
            conn.execute(
                "INSERT INTO dynakubes (Name, TenantUUID, LatestVersion) VALUES ('old', 't1', '1.0-0')",
                [],
            )
            .unwrap();
        }
        let store = Store::open(&path).unwrap();
        let dk = store.get_dynakube("old").unwrap().unwrap();
        assert_eq!(dk.image_digest, "");
        assert_eq!(dk.max_failed_mount_attempts, DEFAULT_MAX_FAILED_MOUNT_ATTEMPTS);
        drop(store);
        assert!(Store::open(&path).unwrap().get_dynakube("old").unwrap().is_some());
    }
}
