//! Anki package writer.
//!
//! An `.apkg` file is a zip archive holding `collection.anki2`, a SQLite
//! database in Anki's legacy (schema 11) layout, plus a `media` manifest. Only
//! what a freshly generated deck needs is written: two note types, one deck,
//! new cards with no review history.

use crate::error::DeckError;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, params};
use serde_json::{Value, json};
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use telegram2anki_types::Flashcard;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

// Ids must stay constant between runs so Anki merges each new package into
// the same deck and note types instead of creating copies.
pub const DECK_ID: i64 = 1607392319;
pub const BASIC_MODEL_ID: i64 = 1607392320;
pub const CLOZE_MODEL_ID: i64 = 1607392321;

const FIELD_SEPARATOR: &str = "\x1f";

const CARD_CSS: &str = ".card {
    font-family: arial;
    font-size: 20px;
    text-align: center;
    color: black;
    background-color: white;
}
";

const CLOZE_CSS: &str = ".cloze {
    font-weight: bold;
    color: blue;
}
";

const LATEX_PRE: &str = "\\documentclass[12pt]{article}\n\\special{papersize=3in,5in}\n\\usepackage[utf8]{inputenc}\n\\usepackage{amssymb,amsmath}\n\\pagestyle{empty}\n\\setlength{\\parindent}{0in}\n\\begin{document}\n";
const LATEX_POST: &str = "\\end{document}";

const SCHEMA: &str = "
CREATE TABLE col (
    id      integer primary key,
    crt     integer not null,
    mod     integer not null,
    scm     integer not null,
    ver     integer not null,
    dty     integer not null,
    usn     integer not null,
    ls      integer not null,
    conf    text not null,
    models  text not null,
    decks   text not null,
    dconf   text not null,
    tags    text not null
);
CREATE TABLE notes (
    id      integer primary key,
    guid    text not null,
    mid     integer not null,
    mod     integer not null,
    usn     integer not null,
    tags    text not null,
    flds    text not null,
    sfld    integer not null,
    csum    integer not null,
    flags   integer not null,
    data    text not null
);
CREATE TABLE cards (
    id      integer primary key,
    nid     integer not null,
    did     integer not null,
    ord     integer not null,
    mod     integer not null,
    usn     integer not null,
    type    integer not null,
    queue   integer not null,
    due     integer not null,
    ivl     integer not null,
    factor  integer not null,
    reps    integer not null,
    lapses  integer not null,
    left    integer not null,
    odue    integer not null,
    odid    integer not null,
    flags   integer not null,
    data    text not null
);
CREATE TABLE revlog (
    id      integer primary key,
    cid     integer not null,
    usn     integer not null,
    ease    integer not null,
    ivl     integer not null,
    lastIvl integer not null,
    factor  integer not null,
    time    integer not null,
    type    integer not null
);
CREATE TABLE graves (
    usn     integer not null,
    oid     integer not null,
    type    integer not null
);
CREATE INDEX ix_notes_usn ON notes (usn);
CREATE INDEX ix_cards_usn ON cards (usn);
CREATE INDEX ix_revlog_usn ON revlog (usn);
CREATE INDEX ix_cards_nid ON cards (nid);
CREATE INDEX ix_cards_sched ON cards (did, queue, due);
CREATE INDEX ix_revlog_cid ON revlog (cid);
CREATE INDEX ix_notes_csum ON notes (csum);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelKind {
    Standard,
    Cloze,
}

struct Template {
    name: &'static str,
    qfmt: &'static str,
    afmt: &'static str,
}

struct NoteModel {
    id: i64,
    name: &'static str,
    kind: ModelKind,
    fields: &'static [&'static str],
    templates: &'static [Template],
}

const BASIC_MODEL: NoteModel = NoteModel {
    id: BASIC_MODEL_ID,
    name: "Telegram2Anki Basic",
    kind: ModelKind::Standard,
    fields: &["Front", "Back"],
    templates: &[Template {
        name: "Card 1",
        qfmt: "{{Front}}",
        afmt: "{{FrontSide}}<hr id=\"answer\">{{Back}}",
    }],
};

const CLOZE_MODEL: NoteModel = NoteModel {
    id: CLOZE_MODEL_ID,
    name: "Telegram2Anki Cloze",
    kind: ModelKind::Cloze,
    fields: &["Text", "Extra"],
    templates: &[Template {
        name: "Cloze",
        qfmt: "{{cloze:Text}}",
        afmt: "{{cloze:Text}}<br>{{Extra}}",
    }],
};

impl NoteModel {
    fn to_json(&self, deck_id: i64, modified: i64) -> Value {
        let fields: Vec<Value> = self
            .fields
            .iter()
            .enumerate()
            .map(|(ord, name)| {
                json!({
                    "name": name,
                    "ord": ord,
                    "sticky": false,
                    "rtl": false,
                    "font": "Arial",
                    "size": 20,
                    "media": [],
                })
            })
            .collect();

        let templates: Vec<Value> = self
            .templates
            .iter()
            .enumerate()
            .map(|(ord, t)| {
                json!({
                    "name": t.name,
                    "ord": ord,
                    "qfmt": t.qfmt,
                    "afmt": t.afmt,
                    "did": null,
                    "bqfmt": "",
                    "bafmt": "",
                })
            })
            .collect();

        let (model_type, css) = match self.kind {
            ModelKind::Standard => (0, CARD_CSS.to_string()),
            ModelKind::Cloze => (1, format!("{}{}", CARD_CSS, CLOZE_CSS)),
        };

        let mut model = json!({
            "id": self.id,
            "name": self.name,
            "type": model_type,
            "mod": modified,
            "usn": -1,
            "sortf": 0,
            "did": deck_id,
            "tmpls": templates,
            "flds": fields,
            "css": css,
            "latexPre": LATEX_PRE,
            "latexPost": LATEX_POST,
            "latexsvg": false,
            "tags": [],
            "vers": [],
        });
        if self.kind == ModelKind::Standard {
            // Card 1 is generated when the first field is non-empty
            model["req"] = json!([[0, "any", [0]]]);
        }
        model
    }
}

/// A note queued for packaging
#[derive(Debug, Clone)]
struct PendingNote {
    model_id: i64,
    fields: Vec<String>,
    /// Template (or cloze) ordinals to generate cards for
    card_ords: Vec<u32>,
}

impl PendingNote {
    fn from_card(card: &Flashcard) -> Option<Self> {
        if !card.is_valid() {
            return None;
        }
        match card {
            Flashcard::Basic { front, back } => Some(Self {
                model_id: BASIC_MODEL_ID,
                fields: vec![to_field_html(front), to_field_html(back)],
                card_ords: vec![0],
            }),
            Flashcard::Cloze { text, extra } => Some(Self {
                model_id: CLOZE_MODEL_ID,
                fields: vec![
                    to_field_html(text),
                    extra.as_deref().map(to_field_html).unwrap_or_default(),
                ],
                card_ords: card.cloze_ordinals().into_iter().map(|n| n - 1).collect(),
            }),
            Flashcard::Unknown => None,
        }
    }

    fn guid(&self) -> String {
        guid_for(self.model_id, &self.fields)
    }
}

/// Collects flashcards and writes them out as one Anki package.
pub struct DeckBuilder {
    name: String,
    deck_id: i64,
    description: String,
    notes: Vec<PendingNote>,
}

impl DeckBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            deck_id: DECK_ID,
            description: String::new(),
            notes: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns false for cards that can't be packaged.
    pub fn add_card(&mut self, card: &Flashcard) -> bool {
        match PendingNote::from_card(card) {
            Some(note) => {
                self.notes.push(note);
                true
            }
            None => {
                log::warn!("[DECK] Skipping invalid {} card", card.kind());
                false
            }
        }
    }

    /// Adds every packageable card, returning how many were added.
    pub fn add_cards(&mut self, cards: &[Flashcard]) -> usize {
        cards.iter().filter(|card| self.add_card(card)).count()
    }

    pub fn note_count(&self) -> usize {
        self.notes.len()
    }

    /// Cards Anki will generate (cloze notes yield one per deletion number)
    pub fn card_count(&self) -> usize {
        self.notes.iter().map(|n| n.card_ords.len()).sum()
    }

    /// Writes the package to `path`, replacing any existing file.
    pub fn write_package(&self, path: &Path) -> Result<(), DeckError> {
        self.write_package_at(path, Utc::now())
    }

    fn write_package_at(&self, path: &Path, now: DateTime<Utc>) -> Result<(), DeckError> {
        let workdir = tempfile::tempdir()?;
        let collection_path = workdir.path().join("collection.anki2");

        {
            let mut conn = Connection::open(&collection_path)?;
            self.write_collection(&mut conn, now)?;
        }
        let collection = std::fs::read(&collection_path)?;

        let file = File::create(path)?;
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.start_file("collection.anki2", options)?;
        zip.write_all(&collection)?;
        zip.start_file("media", options)?;
        zip.write_all(b"{}")?;
        zip.finish()?;

        log::info!(
            "[DECK] Wrote {} ({} notes, {} cards)",
            path.display(),
            self.note_count(),
            self.card_count()
        );
        Ok(())
    }

    fn write_collection(&self, conn: &mut Connection, now: DateTime<Utc>) -> Result<(), DeckError> {
        let now_secs = now.timestamp();
        let now_ms = now.timestamp_millis();
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc().timestamp())
            .unwrap_or(now_secs);

        let tx = conn.transaction()?;
        tx.execute_batch(SCHEMA)?;

        let models = json!({
            BASIC_MODEL_ID.to_string(): BASIC_MODEL.to_json(self.deck_id, now_secs),
            CLOZE_MODEL_ID.to_string(): CLOZE_MODEL.to_json(self.deck_id, now_secs),
        });

        tx.execute(
            "INSERT INTO col (id, crt, mod, scm, ver, dty, usn, ls, conf, models, decks, dconf, tags)
             VALUES (1, ?1, ?2, ?2, 11, 0, 0, 0, ?3, ?4, ?5, ?6, '{}')",
            params![
                day_start,
                now_ms,
                serde_json::to_string(&collection_conf(self.card_count()))?,
                serde_json::to_string(&models)?,
                serde_json::to_string(&self.decks_json(now_secs))?,
                serde_json::to_string(&default_deck_options())?,
            ],
        )?;

        // Note and card ids are creation timestamps in ms; keep them unique
        let mut next_id = now_ms;
        let mut due = 0i64;

        for note in &self.notes {
            let note_id = next_id;
            next_id += 1;

            let sort_field = strip_html(&note.fields[0]);
            tx.execute(
                "INSERT INTO notes (id, guid, mid, mod, usn, tags, flds, sfld, csum, flags, data)
                 VALUES (?1, ?2, ?3, ?4, -1, '', ?5, ?6, ?7, 0, '')",
                params![
                    note_id,
                    note.guid(),
                    note.model_id,
                    now_secs,
                    note.fields.join(FIELD_SEPARATOR),
                    sort_field,
                    field_checksum(&sort_field),
                ],
            )?;

            due += 1;
            for ord in &note.card_ords {
                tx.execute(
                    "INSERT INTO cards (id, nid, did, ord, mod, usn, type, queue, due, ivl, factor,
                                        reps, lapses, left, odue, odid, flags, data)
                     VALUES (?1, ?2, ?3, ?4, ?5, -1, 0, 0, ?6, 0, 0, 0, 0, 0, 0, 0, 0, '')",
                    params![next_id, note_id, self.deck_id, ord, now_secs, due],
                )?;
                next_id += 1;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn decks_json(&self, modified: i64) -> Value {
        let deck = |id: i64, name: &str, desc: &str| {
            json!({
                "id": id,
                "name": name,
                "desc": desc,
                "mod": modified,
                "usn": -1,
                "collapsed": false,
                "browserCollapsed": false,
                "conf": 1,
                "dyn": 0,
                "extendNew": 10,
                "extendRev": 50,
                "newToday": [0, 0],
                "revToday": [0, 0],
                "lrnToday": [0, 0],
                "timeToday": [0, 0],
            })
        };

        json!({
            "1": deck(1, "Default", ""),
            self.deck_id.to_string(): deck(self.deck_id, &self.name, &self.description),
        })
    }
}

fn collection_conf(card_count: usize) -> Value {
    json!({
        "activeDecks": [1],
        "curDeck": 1,
        "newSpread": 0,
        "collapseTime": 1200,
        "timeLim": 0,
        "estTimes": true,
        "dueCounts": true,
        "curModel": null,
        "nextPos": card_count + 1,
        "sortType": "noteFld",
        "sortBackwards": false,
        "addToCur": true,
    })
}

fn default_deck_options() -> Value {
    json!({
        "1": {
            "id": 1,
            "name": "Default",
            "mod": 0,
            "usn": 0,
            "maxTaken": 60,
            "autoplay": true,
            "timer": 0,
            "replayq": true,
            "dyn": false,
            "new": {
                "bury": true,
                "delays": [1.0, 10.0],
                "initialFactor": 2500,
                "ints": [1, 4, 7],
                "order": 1,
                "perDay": 20,
                "separate": true,
            },
            "lapse": {
                "delays": [10.0],
                "leechAction": 0,
                "leechFails": 8,
                "minInt": 1,
                "mult": 0.0,
            },
            "rev": {
                "bury": true,
                "ease4": 1.3,
                "fuzz": 0.05,
                "ivlFct": 1.0,
                "maxIvl": 36500,
                "minSpace": 1,
                "perDay": 100,
            },
        }
    })
}

/// `datos_2026-10-19.apkg` for deck "Datos"
pub fn deck_file_name(deck_name: &str, date: NaiveDate) -> String {
    let mut slug = String::new();
    for c in deck_name.trim().chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    let slug = if slug.is_empty() { "deck" } else { slug };
    format!("{}_{}.apkg", slug, date.format("%Y-%m-%d"))
}

/// Model output is plain text; fields are HTML.
fn to_field_html(text: &str) -> String {
    text.trim()
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace("\r\n", "\n")
        .replace('\n', "<br>")
}

/// Field text as Anki sorts and checksums it: tags removed, entities decoded.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

/// First 32 bits of the SHA-1 of the sort field, as Anki stores in `csum`.
fn field_checksum(sort_field: &str) -> i64 {
    let digest = Sha1::digest(sort_field.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as i64
}

const GUID_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!#$%&()*+,-./:;<=>?@[]^_`{|}~";

/// Stable note guid derived from the note type and field contents, so
/// importing the same card twice updates it instead of duplicating it.
fn guid_for(model_id: i64, fields: &[String]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(model_id.to_string().as_bytes());
    for field in fields {
        hasher.update(b"__");
        hasher.update(field.as_bytes());
    }
    let digest = hasher.finalize();

    let mut value = u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    let base = GUID_ALPHABET.len() as u64;
    let mut encoded = Vec::new();
    loop {
        encoded.push(GUID_ALPHABET[(value % base) as usize]);
        value /= base;
        if value == 0 {
            break;
        }
    }
    encoded.reverse();
    encoded.into_iter().map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn sample_deck() -> DeckBuilder {
        let mut deck = DeckBuilder::new("Datos");
        let added = deck.add_cards(&[
            Flashcard::basic("How many hearts does an octopus have?", "Three"),
            Flashcard::cloze("{{c1::Canberra}} is the capital of {{c2::Australia}}"),
            Flashcard::basic("Missing answer", ""),
            Flashcard::Unknown,
        ]);
        assert_eq!(added, 2);
        deck
    }

    /// Extracts collection.anki2 from a package and opens it
    fn open_collection(package: &Path, dir: &Path) -> Connection {
        let mut archive = zip::ZipArchive::new(File::open(package).unwrap()).unwrap();

        let mut media = String::new();
        archive.by_name("media").unwrap().read_to_string(&mut media).unwrap();
        assert_eq!(media, "{}");

        let mut bytes = Vec::new();
        archive
            .by_name("collection.anki2")
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        let path = dir.join("extracted.anki2");
        std::fs::write(&path, bytes).unwrap();
        Connection::open(path).unwrap()
    }

    #[test]
    fn test_counts() {
        let deck = sample_deck();
        assert_eq!(deck.note_count(), 2);
        // basic: 1 card, cloze with c1 + c2: 2 cards
        assert_eq!(deck.card_count(), 3);
    }

    #[test]
    fn test_package_contents() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("datos.apkg");
        sample_deck().write_package(&package).unwrap();

        let conn = open_collection(&package, dir.path());

        let notes: i64 = conn.query_row("SELECT COUNT(*) FROM notes", [], |r| r.get(0)).unwrap();
        let cards: i64 = conn.query_row("SELECT COUNT(*) FROM cards", [], |r| r.get(0)).unwrap();
        assert_eq!(notes, 2);
        assert_eq!(cards, 3);

        let cloze_ords: Vec<i64> = conn
            .prepare("SELECT c.ord FROM cards c JOIN notes n ON n.id = c.nid WHERE n.mid = ?1 ORDER BY c.ord")
            .unwrap()
            .query_map([CLOZE_MODEL_ID], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(cloze_ords, vec![0, 1]);

        let flds: String = conn
            .query_row("SELECT flds FROM notes WHERE mid = ?1", [BASIC_MODEL_ID], |r| r.get(0))
            .unwrap();
        assert_eq!(flds, "How many hearts does an octopus have?\x1fThree");

        let dids: Vec<i64> = conn
            .prepare("SELECT DISTINCT did FROM cards")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(dids, vec![DECK_ID]);

        let (models, decks, ver): (String, String, i64) = conn
            .query_row("SELECT models, decks, ver FROM col", [], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .unwrap();
        assert_eq!(ver, 11);
        let models: Value = serde_json::from_str(&models).unwrap();
        assert_eq!(models[BASIC_MODEL_ID.to_string()]["name"], "Telegram2Anki Basic");
        assert_eq!(models[CLOZE_MODEL_ID.to_string()]["type"], 1);
        let decks: Value = serde_json::from_str(&decks).unwrap();
        assert_eq!(decks[DECK_ID.to_string()]["name"], "Datos");
    }

    #[test]
    fn test_rewrite_replaces_existing_package() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("datos.apkg");
        std::fs::write(&package, b"stale").unwrap();

        let mut deck = DeckBuilder::new("Datos");
        deck.add_card(&Flashcard::basic("Q", "A"));
        deck.write_package(&package).unwrap();

        let conn = open_collection(&package, dir.path());
        let notes: i64 = conn.query_row("SELECT COUNT(*) FROM notes", [], |r| r.get(0)).unwrap();
        assert_eq!(notes, 1);
    }

    #[test]
    fn test_guid_is_stable_and_content_sensitive() {
        let a = guid_for(BASIC_MODEL_ID, &["Q".to_string(), "A".to_string()]);
        let b = guid_for(BASIC_MODEL_ID, &["Q".to_string(), "A".to_string()]);
        let c = guid_for(BASIC_MODEL_ID, &["Q".to_string(), "B".to_string()]);
        let d = guid_for(CLOZE_MODEL_ID, &["Q".to_string(), "A".to_string()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.bytes().all(|byte| GUID_ALPHABET.contains(&byte)));
    }

    #[test]
    fn test_field_html() {
        assert_eq!(to_field_html(" 3 < 5 & 7 > 6 "), "3 &lt; 5 &amp; 7 &gt; 6");
        assert_eq!(to_field_html("line one\nline two"), "line one<br>line two");
        assert_eq!(strip_html("<b>bold</b>&nbsp;&amp; text<br>"), "bold & text");
        assert_eq!(strip_html(&to_field_html("a < b")), "a < b");
    }

    #[test]
    fn test_checksum_matches_sha1_prefix() {
        // sha1("hello") = aaf4c61d...
        assert_eq!(field_checksum("hello"), 0xaaf4c61d);
    }

    #[test]
    fn test_deck_file_name() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert_eq!(deck_file_name("Datos", date), "datos_2026-10-19.apkg");
        assert_eq!(deck_file_name("Fun Facts / Science", date), "fun_facts_science_2026-10-19.apkg");
        assert_eq!(deck_file_name("  ***  ", date), "deck_2026-10-19.apkg");
    }
}
