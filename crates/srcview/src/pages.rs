// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Static HTML output: file pages with highlighted contents and line-number
//! gutters, and directory index pages. File contents sit between search
//! markers so the search subsystem can tell rendered code apart from page
//! chrome.

use std::io::{self, Write};
use std::time::SystemTime;

use tmlang::highlight::{Highlighter, ScopeWriter};

use crate::archive::{Archive, DirectoryEntry, INDEX_FILE_NAME, TEXT_FILE_SIZE_LIMIT, join_path};

pub const BEGIN_SEARCH_MARKER: &str = "<!-- BEGIN SEARCH -->";
pub const END_SEARCH_MARKER: &str = "<!-- END SEARCH -->";

/// Maps a scope name to the CSS class carried through rendering. Only the
/// broad scope families get a class; everything else interns to the zero
/// scope and costs nothing at render time.
pub fn scope_class(name: &str) -> Option<String> {
    let root = name.split('.').next().unwrap_or("");
    match root {
        "comment" | "constant" | "entity" | "invalid" | "keyword" | "markup" | "punctuation"
        | "storage" | "string" | "support" | "variable" => Some(format!("hl-{root}")),
        _ => None,
    }
}

/// Streams highlighted text as spans: scope data is the CSS class.
pub struct HtmlScopeWriter<W: Write> {
    out: W,
}

impl<W: Write> HtmlScopeWriter<W> {
    pub fn new(out: W) -> HtmlScopeWriter<W> {
        HtmlScopeWriter { out }
    }
}

impl<W: Write> ScopeWriter<String> for HtmlScopeWriter<W> {
    fn write_text(&mut self, text: &str) -> io::Result<()> {
        write_escaped(&mut self.out, text)
    }

    fn begin_scope(&mut self, class: &String) -> io::Result<()> {
        write!(self.out, "<span class='{class}'>")
    }

    fn end_scope(&mut self, _class: &String) -> io::Result<()> {
        self.out.write_all(b"</span>")
    }

    fn new_line(&mut self) -> io::Result<()> {
        self.out.write_all(b"\n")
    }
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&#39;"),
            '"' => out.push_str("&#34;"),
            _ => out.push(c),
        }
    }
    out
}

fn write_escaped(out: &mut impl Write, s: &str) -> io::Result<()> {
    let mut rest = s;
    while let Some(pos) = rest.find(['&', '<', '>', '\'', '"']) {
        out.write_all(rest[..pos].as_bytes())?;
        let c = rest.as_bytes()[pos];
        rest = &rest[pos + 1..];
        out.write_all(match c {
            b'&' => b"&amp;".as_slice(),
            b'<' => b"&lt;",
            b'>' => b"&gt;",
            b'\'' => b"&#39;",
            _ => b"&#34;",
        })?;
    }
    out.write_all(rest.as_bytes())
}

/// Identity of the page being written, for titles and breadcrumbs.
pub struct Page<'a> {
    /// Slash-separated path within the archive; "" for the root directory.
    pub name: &'a str,
    pub is_directory: bool,
    /// Display name of the archive itself.
    pub archive_name: &'a str,
}

impl Page<'_> {
    fn write_prologue(&self, w: &mut impl Write) -> io::Result<()> {
        writeln!(w, "<!doctype html>")?;
        writeln!(w, "<html>")?;
        writeln!(w, "  <head>")?;
        writeln!(w, "    <meta charset='utf-8'>")?;
        writeln!(w, "    <meta name='viewport' content='initial-scale=0.9'>")?;
        writeln!(w, "    <link href='/style.css' rel='stylesheet'>")?;
        let title = match self.name.rsplit('/').next() {
            Some(last) if !last.is_empty() => format!("{last} in {}", self.archive_name),
            _ => self.archive_name.to_string(),
        };
        writeln!(w, "    <title>{}</title>", escape_html(&title))?;
        writeln!(w, "  </head>")?;
        writeln!(w, "  <body>")
    }

    fn write_header(&self, w: &mut impl Write) -> io::Result<()> {
        let components: Vec<&str> =
            if self.name.is_empty() { Vec::new() } else { self.name.split('/').collect() };
        let mut depth = components.len();
        if !self.is_directory {
            depth -= 1;
        }
        let root_path = format!("./{}", "../".repeat(depth));

        write!(w, "    <pre class='header'>")?;
        write!(w, "<a href='{root_path}'>{}</a>", escape_html(self.archive_name))?;
        for (i, component) in components.iter().enumerate() {
            if i == components.len() - 1 {
                write!(w, " / <b>{}</b>", escape_html(component))?;
            } else {
                let mut up = "../".repeat(depth - i - 1);
                if up.is_empty() {
                    up.push('.');
                }
                write!(w, " / <a href='{up}'>{}</a>", escape_html(component))?;
            }
        }
        writeln!(w, "</pre>")
    }

    fn write_epilogue(&self, w: &mut impl Write) -> io::Result<()> {
        writeln!(w, "  </body>")?;
        writeln!(w, "</html>")
    }
}

/// Writes the page for one file: gutter with line numbers on the left,
/// highlighted contents on the right.
pub fn write_file_page(
    w: &mut impl Write,
    page: &Page<'_>,
    entry: &DirectoryEntry,
    contents: &[u8],
    highlighter: &Highlighter<String>,
) -> io::Result<()> {
    page.write_prologue(w)?;
    page.write_header(w)?;
    writeln!(w, "    <table class='file'>")?;
    writeln!(
        w,
        "      <colgroup><col span='1' class='line-numbers-column'><col span='1' width='*'></colgroup>"
    )?;
    writeln!(
        w,
        "      <tr class='directory back'><td>&nbsp;</td><td class='filename'><a href='.'>..</a></td></tr>"
    )?;
    write!(w, "      <tr class='fileborder'>")?;
    if entry.size > TEXT_FILE_SIZE_LIMIT {
        write!(w, "<td>&nbsp;</td><td><div class='empty'>file is too big to render</div></td>")?;
    } else {
        write_line_numbers(w, 1, entry.lines.max(0) as usize)?;
        write!(w, "<td valign='top'>")?;
        write_file_contents(w, page, entry, contents, highlighter)?;
        write!(w, "</td>")?;
    }
    writeln!(w, "</tr>")?;
    writeln!(w, "    </table>")?;
    page.write_epilogue(w)
}

fn write_file_contents(
    w: &mut impl Write,
    page: &Page<'_>,
    entry: &DirectoryEntry,
    contents: &[u8],
    highlighter: &Highlighter<String>,
) -> io::Result<()> {
    if entry.lines < 0 {
        return writeln!(w, "<div class='empty'>binary file</div>");
    }
    if contents.is_empty() {
        return writeln!(w, "<div class='empty'>empty file</div>");
    }
    writeln!(w, "<pre class='code file-contents'>")?;
    w.write_all(BEGIN_SEARCH_MARKER.as_bytes())?;
    let text = String::from_utf8_lossy(contents);
    let mut writer = HtmlScopeWriter::new(&mut *w);
    highlighter.highlight(&mut writer, &text, page.name)?;
    w.write_all(END_SEARCH_MARKER.as_bytes())?;
    writeln!(w, "</pre>")
}

fn write_line_numbers(w: &mut impl Write, first_line: usize, lines: usize) -> io::Result<()> {
    write!(w, "<td align='right' valign='top'><pre class='code line-numbers'>")?;
    for i in 0..lines {
        writeln!(w, "{}", first_line + i)?;
    }
    write!(w, "</pre></td>")
}

/// Writes one directory's index page: subdirectories (collapsing chains of
/// single children into a prefix), files with their line counts and sizes,
/// and the readme inlined at the bottom.
pub fn write_directory_page(
    w: &mut impl Write,
    page: &Page<'_>,
    archive: &Archive,
    readme: Option<(&DirectoryEntry, &[u8])>,
    highlighter: &Highlighter<String>,
) -> io::Result<()> {
    let Some(dir) = archive.directories.get(page.name) else {
        return Ok(());
    };
    page.write_prologue(w)?;
    page.write_header(w)?;
    writeln!(w, "    <div class='directory-container'>")?;
    writeln!(w, "      <table class='directory'>")?;
    write!(w, "        <tr class='back'><td>&nbsp;</td><td class='filename' colspan='3'>")?;
    if page.name.is_empty() {
        write!(w, "<a>&nbsp;</a>")?;
    } else {
        write!(w, "<a href='..'>..</a>")?;
    }
    writeln!(w, "</td></tr>")?;

    if dir.file_names.is_empty() && dir.directory_names.is_empty() {
        writeln!(
            w,
            "        <tr><td>&nbsp;</td><td colspan='3'><div class='empty'>empty directory</div></td></tr>"
        )?;
    }

    for (i, name) in dir.directory_names.iter().enumerate() {
        write!(w, "        <tr>")?;
        if i == 0 {
            write!(w, "<td class='category'>directories</td>")?;
        } else {
            write!(w, "<td>&nbsp;</td>")?;
        }
        let entry = &dir.entries[name];
        // Collapse chains of single subdirectories into one row.
        let mut name = name.clone();
        let mut prefix = String::new();
        let mut subdir = &archive.directories[&join_path(page.name, &name)];
        while subdir.directory_names.len() == 1 && subdir.file_names.is_empty() {
            prefix = join_path(&prefix, &name);
            name = subdir.directory_names[0].clone();
            subdir = &archive.directories
                [&join_path(&join_path(page.name, &prefix), &name)];
        }
        write!(w, "<td class='filename'>")?;
        if prefix.is_empty() {
            write!(w, "<a href='./{}/'>{}</a></td>", escape_html(&name), escape_html(&name))?;
        } else {
            write!(
                w,
                "<a href='./{}/{}/'><span class='prefix'>{}/</span>{}</a></td>",
                escape_html(&prefix),
                escape_html(&name),
                escape_html(&prefix),
                escape_html(&name),
            )?;
        }
        match subdir.file_names.len() {
            0 => write!(w, "<td class='light'>&mdash;</td>")?,
            1 => write!(w, "<td>1 file</td>")?,
            n => write!(w, "<td>{n} files</td>")?,
        }
        write!(w, "<td>{}</td>", format_time(entry.modified))?;
        writeln!(w, "</tr>")?;
    }

    for (i, name) in dir.file_names.iter().enumerate() {
        if i == 0 {
            write!(w, "        <tr class='dblborder'><td class='category'>files</td>")?;
        } else {
            write!(w, "        <tr><td>&nbsp;</td>")?;
        }
        let entry = &dir.entries[name];
        write!(
            w,
            "<td class='filename'><a href='./{}'>{}</a></td>",
            escape_html(name),
            escape_html(name)
        )?;
        match entry.lines {
            n if n < 0 => write!(w, "<td class='light'>&mdash;</td>")?,
            1 => write!(w, "<td>1 line</td>")?,
            n => write!(w, "<td>{n} lines</td>")?,
        }
        write!(w, "<td>{} &middot; {}</td>", format_size(entry.size), format_time(entry.modified))?;
        writeln!(w, "</tr>")?;
    }

    if let Some((entry, contents)) = readme
        && !dir.readme_name.is_empty()
    {
        writeln!(w, "        <tr class='border'>")?;
        writeln!(
            w,
            "          <td class='category' valign='top'>README</td><td colspan='2' class='readme'><div class='readme-container'>"
        )?;
        let readme_page = Page {
            name: &join_path(page.name, &dir.readme_name),
            is_directory: false,
            archive_name: page.archive_name,
        };
        write_file_contents(w, &readme_page, entry, contents, highlighter)?;
        writeln!(w, "          </div></td>")?;
        writeln!(w, "        </tr>")?;
    }

    writeln!(w, "      </table>")?;
    writeln!(w, "    </div>")?;
    page.write_epilogue(w)
}

pub fn format_size(size: u64) -> String {
    let s = size as f64;
    if s >= 10_000_000.0 {
        format!("{:.0} MB", s / 1_000_000.0)
    } else if s >= 700_000.0 {
        format!("{:.1} MB", s / 1_000_000.0)
    } else if s >= 10_000.0 {
        format!("{:.0} KB", s / 1000.0)
    } else if s >= 700.0 {
        format!("{:.1} KB", s / 1000.0)
    } else if size == 1 {
        "1 byte".to_string()
    } else {
        format!("{size} bytes")
    }
}

pub fn format_time(t: SystemTime) -> String {
    let dt: chrono::DateTime<chrono::Local> = t.into();
    dt.format("%B %-d, %Y").to_string().to_lowercase()
}

/// The name a directory's index page is stored under.
pub fn directory_page_name(dir: &str) -> String {
    join_path(dir, INDEX_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmlang::rules::RawLanguage;

    #[test]
    fn escaping() {
        assert_eq!(escape_html("a<b>&'\""), "a&lt;b&gt;&amp;&#39;&#34;");
        let mut out = Vec::new();
        write_escaped(&mut out, "x < y && z").unwrap();
        assert_eq!(out, b"x &lt; y &amp;&amp; z");
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(0), "0 bytes");
        assert_eq!(format_size(1), "1 byte");
        assert_eq!(format_size(650), "650 bytes");
        assert_eq!(format_size(1_500), "1.5 KB");
        assert_eq!(format_size(25_000), "25 KB");
        assert_eq!(format_size(800_000), "0.8 MB");
        assert_eq!(format_size(12_000_000), "12 MB");
    }

    #[test]
    fn scope_classes() {
        assert_eq!(scope_class("comment.line.rust"), Some("hl-comment".to_string()));
        assert_eq!(scope_class("keyword.control"), Some("hl-keyword".to_string()));
        assert_eq!(scope_class("meta.group"), None);
        assert_eq!(scope_class("source.rust"), None);
    }

    fn tiny_highlighter() -> Highlighter<String> {
        let lang = RawLanguage::from_json(
            r##"{
                "scopeName": "source.tiny",
                "fileTypes": ["tiny"],
                "patterns": [ { "match": "//.*", "name": "comment.line.tiny" } ]
            }"##,
        )
        .unwrap();
        Highlighter::new(&[lang], scope_class).unwrap()
    }

    #[test]
    fn file_pages_carry_markers_and_spans() {
        let highlighter = tiny_highlighter();
        let entry = DirectoryEntry {
            is_file: true,
            modified: SystemTime::UNIX_EPOCH,
            lines: 2,
            max_line_length: 12,
            size: 20,
        };
        let page = Page { name: "src/a.tiny", is_directory: false, archive_name: "demo" };
        let mut out = Vec::new();
        write_file_page(&mut out, &page, &entry, b"x = 1 // hi\ny = 2", &highlighter).unwrap();
        let html = String::from_utf8(out).unwrap();

        assert!(html.contains(BEGIN_SEARCH_MARKER));
        assert!(html.contains(END_SEARCH_MARKER));
        assert!(html.contains("<span class='hl-comment'>// hi</span>"));
        // Two gutter lines for two lines of text.
        assert!(html.contains("<pre class='code line-numbers'>1\n2\n</pre>"));
    }

    #[test]
    fn binary_files_render_as_a_stub() {
        let highlighter = tiny_highlighter();
        let entry = DirectoryEntry {
            is_file: true,
            modified: SystemTime::UNIX_EPOCH,
            lines: -1,
            max_line_length: 0,
            size: 9,
        };
        let page = Page { name: "blob", is_directory: false, archive_name: "demo" };
        let mut out = Vec::new();
        write_file_page(&mut out, &page, &entry, b"\x00\x01\x02", &highlighter).unwrap();
        let html = String::from_utf8(out).unwrap();
        assert!(html.contains("binary file"));
        assert!(!html.contains(BEGIN_SEARCH_MARKER));
    }
}
