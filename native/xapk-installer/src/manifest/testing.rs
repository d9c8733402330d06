//! Fixture builders: zip archives and compiled `AndroidManifest.xml` documents.

use std::{io::Write, path::Path};

use zip::{ZipWriter, write::SimpleFileOptions};

/// Writes a zip with the given `(name, content)` entries.
pub(crate) fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let mut zip = ZipWriter::new(std::fs::File::create(path).unwrap());
    for (name, content) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(content).unwrap();
    }
    zip.finish().unwrap();
}

const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";
const NO_INDEX: u32 = u32::MAX;
const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;

enum Value<'a> {
    Str(&'a str),
    Int(i64),
}

struct Element<'a> {
    name: &'a str,
    /// `(name, framework resource id or 0, value)`
    attributes: Vec<(&'a str, u32, Value<'a>)>,
    children: Vec<Element<'a>>,
}

/// A `<manifest>` with a `<uses-sdk>` child when either sdk level is given, compiled the way aapt
/// lays it out: framework attribute names first in the pool, matched by the resource map.
pub(crate) fn manifest_xml(
    package: &str,
    version_code: i64,
    min_sdk: Option<i64>,
    target_sdk: Option<i64>,
) -> Vec<u8> {
    let mut sdk = Vec::new();
    if let Some(min) = min_sdk {
        sdk.push(("minSdkVersion", 0x0101_020c, Value::Int(min)));
    }
    if let Some(target) = target_sdk {
        sdk.push(("targetSdkVersion", 0x0101_0270, Value::Int(target)));
    }
    let mut children = Vec::new();
    if !sdk.is_empty() {
        children.push(Element { name: "uses-sdk", attributes: sdk, children: vec![] });
    }
    children.push(Element { name: "application", attributes: vec![], children: vec![] });
    compile(&Element {
        name: "manifest",
        attributes: vec![
            ("versionCode", 0x0101_021b, Value::Int(version_code)),
            ("versionName", 0x0101_021c, Value::Str("1.0")),
            ("package", 0, Value::Str(package)),
        ],
        children,
    })
}

#[derive(Default)]
struct Pool {
    strings: Vec<String>,
    ids: Vec<u32>,
}

impl Pool {
    fn intern(&mut self, value: &str) -> u32 {
        match self.strings.iter().position(|s| s == value) {
            Some(i) => i as u32,
            None => {
                self.strings.push(value.to_string());
                (self.strings.len() - 1) as u32
            }
        }
    }

    fn framework_names(&mut self, element: &Element<'_>) {
        for (name, id, _) in &element.attributes {
            if *id != 0 && !self.strings.iter().any(|s| s == name) {
                self.ids.push(*id);
                self.strings.push(name.to_string());
            }
        }
        for child in &element.children {
            self.framework_names(child);
        }
    }
}

fn put16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn begin(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16) -> usize {
    let start = buf.len();
    put16(buf, chunk_type);
    put16(buf, header_size);
    put32(buf, 0);
    start
}

fn finish(buf: &mut Vec<u8>, start: usize) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
    let size = (buf.len() - start) as u32;
    buf[start + 4..start + 8].copy_from_slice(&size.to_le_bytes());
}

/// Namespace and element node header: line number and comment.
fn node(buf: &mut Vec<u8>, chunk_type: u16) -> usize {
    let start = begin(buf, chunk_type, 16);
    put32(buf, 1);
    put32(buf, NO_INDEX);
    start
}

fn write_element(buf: &mut Vec<u8>, element: &Element<'_>, pool: &mut Pool, ns: u32) {
    let name = pool.intern(element.name);
    let start = node(buf, 0x0102);
    put32(buf, NO_INDEX);
    put32(buf, name);
    for v in [20, 20, element.attributes.len() as u16, 0, 0, 0] {
        put16(buf, v);
    }
    for (attr_name, id, value) in &element.attributes {
        let name_index = pool.intern(attr_name);
        put32(buf, if *id != 0 { ns } else { NO_INDEX });
        put32(buf, name_index);
        let (raw, data_type, data) = match value {
            Value::Str(text) => {
                let index = pool.intern(text);
                (index, TYPE_STRING, index)
            }
            Value::Int(v) => (NO_INDEX, TYPE_INT_DEC, *v as u32),
        };
        put32(buf, raw);
        put16(buf, 8);
        buf.extend_from_slice(&[0, data_type]);
        put32(buf, data);
    }
    finish(buf, start);

    for child in &element.children {
        write_element(buf, child, pool, ns);
    }

    let start = node(buf, 0x0103);
    put32(buf, NO_INDEX);
    put32(buf, name);
    finish(buf, start);
}

fn compile(root: &Element<'_>) -> Vec<u8> {
    let mut pool = Pool::default();
    pool.framework_names(root);
    let prefix = pool.intern("android");
    let ns = pool.intern(ANDROID_NS);

    let mut body = Vec::new();
    for (chunk_type, element) in [(0x0100, Some(root)), (0x0101, None)] {
        let start = node(&mut body, chunk_type);
        put32(&mut body, prefix);
        put32(&mut body, ns);
        finish(&mut body, start);
        if let Some(element) = element {
            write_element(&mut body, element, &mut pool, ns);
        }
    }

    let mut out = Vec::new();
    let document = begin(&mut out, 0x0003, 8);

    let pool_start = begin(&mut out, 0x0001, 28);
    let count = pool.strings.len() as u32;
    for v in [count, 0, 0, 28 + count * 4, 0] {
        put32(&mut out, v);
    }
    let mut data = Vec::new();
    for s in &pool.strings {
        put32(&mut out, data.len() as u32);
        let units: Vec<u16> = s.encode_utf16().collect();
        put16(&mut data, units.len() as u16);
        for unit in units {
            put16(&mut data, unit);
        }
        put16(&mut data, 0);
    }
    out.extend_from_slice(&data);
    finish(&mut out, pool_start);

    let map_start = begin(&mut out, 0x0180, 8);
    for id in &pool.ids {
        put32(&mut out, *id);
    }
    finish(&mut out, map_start);

    out.extend_from_slice(&body);
    finish(&mut out, document);
    out
}
