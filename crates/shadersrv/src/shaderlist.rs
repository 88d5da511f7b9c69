//! Persistent record of every shader permutation clients have requested.
//!
//! Each target keeps one text file with a line per permutation, e.g.
//! `<660><2>Cloth@Common_SG_VS()(%_RT_FOG)(0)(0)(0)(VS)`. Request-line jobs
//! push raw lines; validation, deduplication, and the merged save happen on
//! the tick so the request path never blocks on disk.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tracing::{info, warn};

const SAVE_INTERVAL: Duration = Duration::from_secs(1);
const RENAME_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const RENAME_RETRY_BUDGET: Duration = Duration::from_secs(5);

/// Version/count prefix of a list line. `count == -1` marks the short
/// one-prefix form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryMeta {
    pub version: i64,
    pub count: i64,
}

/// Validates one permutation line and splits it into the canonical body and
/// its metadata. Accepted shapes:
///
/// ```text
/// <version>name@entry(flags)(flags)(hex)(hex)(hex)(profile)
/// <count><version>name@entry(flags)(flags)(hex)(hex)(hex)(profile)
/// ```
pub fn parse_line(line: &str) -> Option<(&str, EntryMeta)> {
    let bytes = line.as_bytes();
    if bytes.len() < 4 {
        return None;
    }

    // NUL-sentinel indexing keeps the scanner bounds-safe without peppering
    // every step with length checks.
    let at = |i: usize| -> u8 {
        if i < bytes.len() {
            bytes[i]
        } else {
            0
        }
    };

    let mut i = 0usize;
    if at(i) != b'<' {
        return None;
    }
    i += 1;
    let mut first: i64 = 0;
    while at(i).is_ascii_digit() {
        first = first * 10 + i64::from(at(i) - b'0');
        i += 1;
    }
    if at(i) != b'>' {
        return None;
    }
    i += 1;

    let meta = if at(i) == b'<' {
        i += 1;
        let mut second: i64 = 0;
        while at(i).is_ascii_digit() {
            second = second * 10 + i64::from(at(i) - b'0');
            i += 1;
        }
        if at(i) != b'>' {
            return None;
        }
        i += 1;
        EntryMeta {
            version: second,
            count: first,
        }
    } else {
        EntryMeta {
            version: first,
            count: -1,
        }
    };

    let body_start = i;

    // name@entry
    while is_name_char(at(i)) {
        i += 1;
    }

    // two |-separated flag groups
    for _ in 0..2 {
        if at(i) != b'(' {
            return None;
        }
        i += 1;
        loop {
            while is_name_char(at(i)) {
                i += 1;
            }
            if at(i) != b'|' {
                break;
            }
            i += 1;
        }
        if at(i) != b')' {
            return None;
        }
        i += 1;
    }

    // three hex groups
    for _ in 0..3 {
        if at(i) != b'(' {
            return None;
        }
        i += 1;
        while at(i).is_ascii_hexdigit() {
            i += 1;
        }
        if at(i) != b')' {
            return None;
        }
        i += 1;
    }

    // profile
    if at(i) != b'(' {
        return None;
    }
    i += 1;
    while is_name_char(at(i)) {
        i += 1;
    }
    if at(i) != b')' {
        return None;
    }

    let body = line[body_start..].trim_end_matches(['\r', '\n']);
    Some((body, meta))
}

/// Inverse of [`parse_line`] for a canonical body.
pub fn format_line(body: &str, meta: EntryMeta) -> String {
    if meta.count == -1 {
        format!("<{}>{}", meta.version, body)
    } else {
        format!("<{}><{}>{}", meta.count, meta.version, body)
    }
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'@' | b'/' | b'%' | b'_')
}

struct FileState {
    entries: std::collections::BTreeMap<String, EntryMeta>,
    new_lines: Vec<String>,
    modified: bool,
}

/// One on-disk permutation list.
pub struct ShaderListFile {
    name: String,
    path: PathBuf,
    tmp_path: PathBuf,
    state: Mutex<FileState>,
}

impl ShaderListFile {
    fn new(name: String, path: PathBuf) -> Self {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        ShaderListFile {
            name,
            tmp_path: PathBuf::from(tmp),
            path,
            state: Mutex::new(FileState {
                entries: Default::default(),
                new_lines: Vec::new(),
                modified: false,
            }),
        }
    }

    fn load(&self) {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(_) => return,
        };
        let mut state = self.state.lock().unwrap();
        let mut valid_lines = 0usize;
        for line in text.lines() {
            if !line.is_empty()
                && !matches!(insert_validated(&mut state.entries, line), Insert::Invalid)
            {
                valid_lines += 1;
            }
        }
        // A file holding duplicates or junk shrinks on load; rewrite it.
        state.modified = valid_lines != state.entries.len();
        info!(
            list = %self.name,
            combinations = valid_lines,
            "loaded shader list"
        );
    }

    /// Queues a raw line. Validation is deferred to the merged save.
    pub fn insert_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.new_lines.push(line.to_string());
        state.modified = true;
    }

    async fn merge_and_save(&self, print_updates: bool) {
        let contents = {
            let mut state = self.state.lock().unwrap();
            if !state.modified {
                return;
            }

            let queued = std::mem::take(&mut state.new_lines);
            state.modified = false;
            for line in &queued {
                match insert_validated(&mut state.entries, line) {
                    Insert::Changed => state.modified = true,
                    Insert::Unchanged => {}
                    Insert::Invalid => {
                        warn!(list = %self.name, line = %line, "discarding invalid shader request line")
                    }
                }
            }
            if !state.modified {
                // Every queued line was a duplicate or invalid.
                return;
            }
            state.modified = false;

            let mut out = String::new();
            for (body, meta) in &state.entries {
                out.push_str(&format_line(body, *meta));
                out.push('\n');
            }
            out
        };

        if print_updates {
            info!(list = %self.name, "updating shader list");
        }
        self.save(contents).await;
    }

    async fn save(&self, contents: String) {
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        if let Err(error) = tokio::fs::write(&self.tmp_path, contents).await {
            warn!(path = %self.tmp_path.display(), %error, "could not write shader list");
            return;
        }

        // The engine may be copying the live file; keep retrying the swap
        // for a bounded time, then give up until the next save.
        if tokio::fs::metadata(&self.path).await.is_ok() {
            let mut waited = Duration::ZERO;
            while let Err(error) = tokio::fs::remove_file(&self.path).await {
                if waited >= RENAME_RETRY_BUDGET {
                    warn!(path = %self.path.display(), %error, "could not replace shader list");
                    return;
                }
                tokio::time::sleep(RENAME_RETRY_INTERVAL).await;
                waited += RENAME_RETRY_INTERVAL;
            }
        }

        let mut waited = Duration::ZERO;
        while let Err(error) = tokio::fs::rename(&self.tmp_path, &self.path).await {
            if waited >= RENAME_RETRY_BUDGET {
                warn!(path = %self.path.display(), %error, "could not rename shader list into place");
                return;
            }
            tokio::time::sleep(RENAME_RETRY_INTERVAL).await;
            waited += RENAME_RETRY_INTERVAL;
        }
    }
}

enum Insert {
    Invalid,
    Unchanged,
    Changed,
}

fn insert_validated(
    entries: &mut std::collections::BTreeMap<String, EntryMeta>,
    line: &str,
) -> Insert {
    let Some((body, meta)) = parse_line(line) else {
        return Insert::Invalid;
    };
    match entries.get_mut(body) {
        None => {
            entries.insert(body.to_string(), meta);
            Insert::Changed
        }
        Some(existing) => {
            if existing.version < meta.version {
                *existing = meta;
                Insert::Changed
            } else if existing.count != -1 && meta.count > existing.count {
                existing.count = meta.count;
                Insert::Changed
            } else {
                Insert::Unchanged
            }
        }
    }
}

/// All shader-list files, keyed by their cache-relative path.
pub struct ShaderListStore {
    root: PathBuf,
    print_updates: bool,
    files: Mutex<HashMap<String, Arc<ShaderListFile>>>,
    save_lock: tokio::sync::Mutex<()>,
    last_save: Mutex<Option<Instant>>,
}

impl ShaderListStore {
    pub fn new(root: impl Into<PathBuf>, print_updates: bool) -> Self {
        ShaderListStore {
            root: root.into(),
            print_updates,
            files: Mutex::new(HashMap::new()),
            save_lock: tokio::sync::Mutex::new(()),
            last_save: Mutex::new(None),
        }
    }

    /// Absolute path of a list, for readers outside the store.
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Queues one raw line for `name`, creating and loading the file on
    /// first use.
    pub fn add(&self, name: &str, line: &str) {
        let file = {
            let mut files = self.files.lock().unwrap();
            match files.get(name) {
                Some(file) => file.clone(),
                None => {
                    let file = Arc::new(ShaderListFile::new(
                        name.to_string(),
                        self.root.join(name),
                    ));
                    file.load();
                    files.insert(name.to_string(), file.clone());
                    file
                }
            }
        };
        file.insert_line(line);
    }

    /// Saves modified lists roughly once a second. Driven by the tick
    /// worker.
    pub async fn tick(&self) {
        {
            let mut last = self.last_save.lock().unwrap();
            match *last {
                Some(at) if at.elapsed() < SAVE_INTERVAL => return,
                _ => *last = Some(Instant::now()),
            }
        }
        self.save_all().await;
    }

    /// Merges and saves every modified list immediately.
    pub async fn save_all(&self) {
        let _guard = self.save_lock.lock().await;
        let files: Vec<Arc<ShaderListFile>> = {
            let files = self.files.lock().unwrap();
            files.values().cloned().collect()
        };
        for file in files {
            file.merge_and_save(self.print_updates).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_known_good_lines() {
        let cases = [
            "<1>watervolume@WaterVolumeOutofPS()()(0)(0)(0)(ps_2_0)",
            "<1>Blurcloak@BlurCloakPS(%BUMP_MAP)(%_RT_FOG|%_RT_HDR_MODE|%_RT_BUMP)(0)(0)(1)(ps_2_0)",
            "<1>Illum@IlluminationVS(%DIFFUSE|%SPECULAR|%BUMP_MAP|%VERTCOLORS|%STAT_BRANCHING)(%_RT_RAE_GEOMTERM)(101)(0)(0)(vs_2_0)",
            "<660><2>Cloth@Common_SG_VS()(%_RT_QUALITY|%_RT_SHAPEDEFORM|%_RT_SKELETON_SSD|%_RT_HW_PCF_COMPARE)(0)(0)(0)(VS)",
            "<6452><2>ShadowMaskGen@FrustumClipVolumeVS()()(0)(0)(0)(VS)",
            "<5604><2>ParticlesNoMat@ParticlePS()(%_RT_FOG|%_RT_AMBIENT|%_RT_ALPHABLEND|%_RT_QUALITY1)(0)(0)(0)(PS)",
        ];
        for line in cases {
            assert!(parse_line(line).is_some(), "{line}");
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        let cases = [
            "",
            "<1>",
            "noprefix@PS()()(0)(0)(0)(ps_2_0)",
            "<1>Burninglayer@BurnPS()(%_RT_ADDBLEND|%_RT_)HDR_MODE|%_RT_BUMP|%_RT_3DC)(0)(0)(0)(ps_2_0)",
            "<1>Missing@Groups()(0)(0)(ps_2_0)",
            "<1>BadHex@PS()()(0)(0x)(0)(ps_2_0)",
        ];
        for line in cases {
            assert!(parse_line(line).is_none(), "{line}");
        }
    }

    #[test]
    fn prefix_forms_carry_version_and_count() {
        let (body, meta) = parse_line("<3>Foo@Bar()()(0)(0)(0)(PS)").unwrap();
        assert_eq!(body, "Foo@Bar()()(0)(0)(0)(PS)");
        assert_eq!(meta, EntryMeta { version: 3, count: -1 });

        let (body, meta) = parse_line("<660><2>Foo@Bar()()(0)(0)(0)(PS)\r\n").unwrap();
        assert_eq!(body, "Foo@Bar()()(0)(0)(0)(PS)");
        assert_eq!(
            meta,
            EntryMeta {
                version: 2,
                count: 660
            }
        );
    }

    #[test]
    fn parse_inverts_format() {
        let bodies = [
            ("Foo@Bar()()(0)(0)(0)(PS)", EntryMeta { version: 7, count: -1 }),
            (
                "Cloth@Common_SG_VS()(%_RT_FOG)(a0)(0)(F)(VS)",
                EntryMeta {
                    version: 2,
                    count: 660,
                },
            ),
        ];
        for (body, meta) in bodies {
            let line = format_line(body, meta);
            assert_eq!(parse_line(&line), Some((body, meta)));
        }
    }

    #[test]
    fn version_dominance_replaces_the_whole_meta() {
        let mut entries = std::collections::BTreeMap::new();
        insert_validated(&mut entries, "<1>Foo@Bar()()(0)(0)(0)(PS)");
        insert_validated(&mut entries, "<2>Foo@Bar()()(0)(0)(0)(PS)");
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries["Foo@Bar()()(0)(0)(0)(PS)"],
            EntryMeta {
                version: 2,
                count: -1
            }
        );

        // Lower version does not downgrade.
        insert_validated(&mut entries, "<1>Foo@Bar()()(0)(0)(0)(PS)");
        assert_eq!(entries["Foo@Bar()()(0)(0)(0)(PS)"].version, 2);
    }

    #[test]
    fn count_dominance_needs_an_existing_count() {
        let mut entries = std::collections::BTreeMap::new();
        insert_validated(&mut entries, "<10><2>Foo@Bar()()(0)(0)(0)(PS)");
        insert_validated(&mut entries, "<99><2>Foo@Bar()()(0)(0)(0)(PS)");
        assert_eq!(
            entries["Foo@Bar()()(0)(0)(0)(PS)"],
            EntryMeta {
                version: 2,
                count: 99
            }
        );

        // A countless existing entry keeps its -1 at equal version.
        let mut entries = std::collections::BTreeMap::new();
        insert_validated(&mut entries, "<2>Foo@Bar()()(0)(0)(0)(PS)");
        insert_validated(&mut entries, "<99><2>Foo@Bar()()(0)(0)(0)(PS)");
        assert_eq!(entries["Foo@Bar()()(0)(0)(0)(PS)"].count, -1);
    }

    #[tokio::test]
    async fn merged_save_dedupes_and_writes_sorted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShaderListStore::new(dir.path(), false);

        store.add("PPC-D3D11_FXC-D3D11/L", "<1>Foo@Bar()()(0)(0)(0)(ps_5_0)");
        store.add("PPC-D3D11_FXC-D3D11/L", "<2>Foo@Bar()()(0)(0)(0)(ps_5_0)");
        store.add("PPC-D3D11_FXC-D3D11/L", "not a valid line");
        store.save_all().await;

        let written =
            std::fs::read_to_string(dir.path().join("PPC-D3D11_FXC-D3D11/L")).unwrap();
        assert_eq!(written, "<2>Foo@Bar()()(0)(0)(0)(ps_5_0)\n");
    }

    #[tokio::test]
    async fn save_merges_with_existing_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lists")).unwrap();
        std::fs::write(
            dir.path().join("lists/L"),
            "<1>Old@Line()()(0)(0)(0)(PS)\n",
        )
        .unwrap();

        let store = ShaderListStore::new(dir.path(), false);
        store.add("lists/L", "<1>New@Line()()(0)(0)(0)(PS)");
        store.save_all().await;

        let written = std::fs::read_to_string(dir.path().join("lists/L")).unwrap();
        assert!(written.contains("<1>Old@Line()()(0)(0)(0)(PS)\n"));
        assert!(written.contains("<1>New@Line()()(0)(0)(0)(PS)\n"));
    }
}
