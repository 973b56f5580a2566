// Copyright 2023 Xayn AG
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Reading migration files from disk.

use std::{collections::HashSet, fs, path::Path};

use sha2::{Digest, Sha256};

use crate::{error::SiloError, migration::MigrationFile};

/// Loads all `*.sql` files of a folder, ordered by sequence.
///
/// A missing folder yields an empty list, everything that is not a `.sql`
/// file is ignored and names must be unique. Files are re-read on every
/// call, one migration operation consults the loader exactly once.
pub(crate) fn load_migrations(folder: &Path) -> Result<Vec<MigrationFile>, SiloError> {
    let unreadable = |source| SiloError::MigrationsUnreadable {
        path: folder.display().to_string(),
        source,
    };

    if !folder.is_dir() {
        return Ok(Vec::new());
    }

    let mut migrations = Vec::new();
    for entry in fs::read_dir(folder).map_err(unreadable)? {
        let path = entry.map_err(unreadable)?.path();
        if !path.is_file() || path.extension().map_or(true, |extension| extension != "sql") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };

        let sql = fs::read_to_string(&path).map_err(unreadable)?;
        migrations.push(MigrationFile {
            name: name.to_owned(),
            sequence: leading_sequence(name),
            hash: sha256_hex(sql.as_bytes()),
            sql,
            path,
        });
    }

    migrations.sort_by(|a, b| (a.sequence, &a.name).cmp(&(b.sequence, &b.name)));

    let mut seen = HashSet::new();
    for migration in &migrations {
        if !seen.insert(migration.name.as_str()) {
            return Err(SiloError::DuplicateMigration {
                name: migration.name.clone(),
            });
        }
    }

    Ok(migrations)
}

/// `0007_add_index` → `7`; `0` if the name has no leading integer.
fn leading_sequence(name: &str) -> u64 {
    let digits = name
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>();
    digits.parse().unwrap_or(0)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write(folder: &Path, name: &str, sql: &str) {
        fs::write(folder.join(name), sql).unwrap();
    }

    #[test]
    fn test_missing_folder_is_empty() {
        let folder = tempfile::tempdir().unwrap();
        let missing = folder.path().join("does_not_exist");
        assert!(load_migrations(&missing).unwrap().is_empty());
    }

    #[test]
    fn test_loads_sorted_by_sequence_and_ignores_non_sql() {
        let folder = tempfile::tempdir().unwrap();
        write(folder.path(), "0002_add.sql", "ALTER TABLE t ADD COLUMN v text;");
        write(folder.path(), "0001_init.sql", "CREATE TABLE t(id int);");
        write(folder.path(), "0010_late.sql", "SELECT 1;");
        write(folder.path(), "notes.txt", "not a migration");
        write(folder.path(), "journal.json", "{}");

        let migrations = load_migrations(folder.path()).unwrap();
        let names = migrations
            .iter()
            .map(|migration| migration.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["0001_init", "0002_add", "0010_late"]);
        assert_eq!(migrations[0].sequence, 1);
        assert_eq!(migrations[2].sequence, 10);
    }

    #[test]
    fn test_missing_sequence_defaults_to_zero() {
        let folder = tempfile::tempdir().unwrap();
        write(folder.path(), "baseline.sql", "SELECT 1;");
        write(folder.path(), "0001_init.sql", "SELECT 1;");

        let migrations = load_migrations(folder.path()).unwrap();
        assert_eq!(migrations[0].name, "baseline");
        assert_eq!(migrations[0].sequence, 0);
    }

    #[test]
    fn test_hash_is_lowercase_hex_of_content() {
        let folder = tempfile::tempdir().unwrap();
        write(folder.path(), "0001_init.sql", "CREATE TABLE t(id int);");

        let migrations = load_migrations(folder.path()).unwrap();
        let hash = &migrations[0].hash;
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|chr| chr.is_ascii_hexdigit() && !chr.is_ascii_uppercase()));
        assert_eq!(hash, &sha256_hex(b"CREATE TABLE t(id int);"));
    }

    #[test]
    fn test_content_change_changes_hash() {
        assert_ne!(sha256_hex(b"a"), sha256_hex(b"b"));
    }
}
