use serde::Deserialize;
use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    page_size: Option<usize>,
    max_pages: Option<usize>,
    min_grow_pages: Option<usize>,
}

#[derive(Deserialize)]
struct ClassEntry {
    size: usize,
    pages: Option<usize>,
}

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    config: ConfigSection,
    /// Shorthand: sizes only, pages derived.
    #[serde(default)]
    classes: Vec<usize>,
    #[serde(default)]
    class: Vec<ClassEntry>,
}

struct Layout {
    page_size: usize,
    max_pages: usize,
    min_grow_pages: usize,
}

struct ClassDef {
    size: usize,
    pages: usize,
}

impl ClassDef {
    fn objects(&self, page_size: usize) -> usize {
        self.pages * page_size / self.size
    }
}

/// Pages per growth run when a class does not name one: the smallest run
/// that wastes at most 1/8 of its bytes to the tail remainder.
fn auto_pages(size: usize, page_size: usize) -> usize {
    (size.div_ceil(page_size)..)
        .find(|pages| {
            let run = pages * page_size;
            (run % size) * 8 <= run
        })
        .unwrap()
}

fn resolve_layout(cfg: &ConfigSection) -> Layout {
    let layout = Layout {
        page_size: cfg.page_size.unwrap_or(4096),
        max_pages: cfg.max_pages.unwrap_or(128),
        min_grow_pages: cfg.min_grow_pages.unwrap_or(256),
    };
    assert!(
        layout.page_size.is_power_of_two() && layout.page_size >= 4096,
        "page_size ({}) must be a power of 2 and >= 4096",
        layout.page_size
    );
    assert!(layout.max_pages > 0, "max_pages must be > 0");
    assert!(layout.min_grow_pages > 0, "min_grow_pages must be > 0");
    layout
}

fn resolve_classes(file: &ConfigFile, page_size: usize) -> Vec<ClassDef> {
    let defs: Vec<ClassDef> = match (file.classes.is_empty(), file.class.is_empty()) {
        (false, true) => file
            .classes
            .iter()
            .map(|&size| ClassDef {
                size,
                pages: auto_pages(size, page_size),
            })
            .collect(),
        (true, false) => file
            .class
            .iter()
            .map(|c| ClassDef {
                size: c.size,
                pages: c.pages.unwrap_or_else(|| auto_pages(c.size, page_size)),
            })
            .collect(),
        (false, false) => panic!("sweepalloc config: use either `classes = [...]` or `[[class]]`, not both"),
        (true, true) => panic!("sweepalloc config: no size classes defined"),
    };

    assert!(defs.len() < 64, "sweepalloc config: too many classes ({}, max 63)", defs.len());
    let mut prev = 0;
    for (i, d) in defs.iter().enumerate() {
        assert!(
            d.size > 0 && d.size % 8 == 0,
            "class {}: size {} must be a positive multiple of 8",
            i,
            d.size
        );
        assert!(d.size > prev, "class {}: size {} must exceed previous size {}", i, d.size, prev);
        assert!(
            d.pages > 0 && d.objects(page_size) > 0,
            "class {}: {} pages cannot hold one {}-byte object",
            i,
            d.pages,
            d.size
        );
        assert!(
            d.objects(page_size) <= u32::MAX as usize,
            "class {}: too many objects per span",
            i
        );
        prev = d.size;
    }
    defs
}

fn config_source(layout: &Layout, defs: &[ClassDef]) -> String {
    let max_objects = defs.iter().map(|d| d.objects(layout.page_size)).max().unwrap_or(1);
    let mut out = String::from("// Generated by build.rs from the sweepalloc config.\n\n");
    for (name, value) in [
        ("PAGE_SHIFT", layout.page_size.trailing_zeros() as usize),
        ("PAGE_SIZE", layout.page_size),
        ("MAX_PAGES", layout.max_pages),
        ("MIN_GROW_PAGES", layout.min_grow_pages),
        ("MAX_OBJECTS_PER_SPAN", max_objects),
        ("MARK_WORDS", max_objects.div_ceil(64)),
    ] {
        writeln!(out, "pub const {name}: usize = {value};").unwrap();
    }
    out
}

fn size_class_source(defs: &[ClassDef]) -> String {
    let n = defs.len() + 1;
    let mut out = String::from("// Generated by build.rs from the sweepalloc config.\n\n");
    writeln!(out, "pub const NUM_SIZE_CLASSES: usize = {n};\n").unwrap();
    writeln!(out, "pub static SIZE_CLASSES: [SizeClassInfo; {n}] = [").unwrap();
    writeln!(out, "    SizeClassInfo {{ size: 0, pages: 0 }}, // sentinel").unwrap();
    for d in defs {
        writeln!(out, "    SizeClassInfo {{ size: {}, pages: {} }},", d.size, d.pages).unwrap();
    }
    out.push_str("];\n");
    out
}

fn main() {
    println!("cargo:rerun-if-env-changed=SWEEPALLOC_CONFIG");
    let path = env::var("SWEEPALLOC_CONFIG").unwrap_or_else(|_| {
        format!("{}/sweepalloc.toml", env::var("CARGO_MANIFEST_DIR").unwrap())
    });
    println!("cargo:rerun-if-changed={path}");

    let text = fs::read_to_string(&path).unwrap_or_else(|e| panic!("failed to read {path}: {e}"));
    let file: ConfigFile = toml::from_str(&text).unwrap_or_else(|e| panic!("failed to parse {path}: {e}"));

    let layout = resolve_layout(&file.config);
    let defs = resolve_classes(&file, layout.page_size);

    let out_dir = env::var("OUT_DIR").unwrap();
    let out = Path::new(&out_dir);
    fs::write(out.join("config_gen.rs"), config_source(&layout, &defs)).expect("failed to write config_gen.rs");
    fs::write(out.join("size_class_gen.rs"), size_class_source(&defs)).expect("failed to write size_class_gen.rs");
}
