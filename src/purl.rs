//! Package URL parsing and normalization.
//!
//! Accepts `pkg:type/namespace/name@version?qualifiers#subpath` and renders a
//! canonical string, so that two spellings of the same package compare equal.

use std::fmt;
use std::str::FromStr;

use crate::error::{PatchError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Purl {
    pub ty: String,
    pub namespace: Option<String>,
    pub name: String,
    pub version: Option<String>,
    pub qualifiers: Vec<(String, String)>,
    pub subpath: Option<String>,
}

impl Purl {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |why: &str| PatchError::Input(format!("Invalid package URL '{}': {}", input, why));

        let s = input.trim();
        let rest = match s.get(..4) {
            Some(scheme) if scheme.eq_ignore_ascii_case("pkg:") => &s[4..],
            _ => return Err(invalid("must start with 'pkg:'")),
        };
        let rest = rest.trim_start_matches('/');

        let (rest, subpath) = match rest.split_once('#') {
            Some((head, sub)) => {
                let sub = sub.trim_matches('/');
                (head, (!sub.is_empty()).then(|| decode(sub)))
            }
            None => (rest, None),
        };
        let (rest, qualifiers) = match rest.split_once('?') {
            Some((head, q)) => (head, parse_qualifiers(q)),
            None => (rest, Vec::new()),
        };

        let (ty, rest) = rest.split_once('/').ok_or_else(|| invalid("missing package name"))?;
        let ty = ty.to_ascii_lowercase();
        let valid_ty = ty.chars().next().is_some_and(|c| c.is_ascii_lowercase())
            && ty
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '+' | '-'));
        if !valid_ty {
            return Err(invalid("invalid package type"));
        }

        let rest = rest.trim_end_matches('/');
        // The version separator is the last '@' after the last '/', so a raw `@scope/` stays in the namespace.
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (path, version) = match rest[last_slash..].rfind('@') {
            Some(i) if last_slash + i > 0 => {
                let at = last_slash + i;
                let v = &rest[at + 1..];
                (&rest[..at], (!v.is_empty()).then(|| decode(v)))
            }
            Some(_) => return Err(invalid("missing package name")),
            None => (rest, None),
        };

        let mut segments: Vec<String> = path
            .split('/')
            .filter(|seg| !seg.is_empty())
            .map(decode)
            .collect();
        let name = segments.pop().ok_or_else(|| invalid("missing package name"))?;
        if name.trim().is_empty() {
            return Err(invalid("missing package name"));
        }
        let namespace = (!segments.is_empty()).then(|| segments.join("/"));

        let mut purl = Purl {
            ty,
            namespace,
            name,
            version,
            qualifiers,
            subpath,
        };
        purl.normalize();
        Ok(purl)
    }

    fn normalize(&mut self) {
        match self.ty.as_str() {
            "npm" => {
                self.name = self.name.to_lowercase();
                self.namespace = self.namespace.take().map(|ns| ns.to_lowercase());
            }
            "pypi" => {
                self.name = self.name.to_lowercase().replace('_', "-");
            }
            _ => {}
        }
        self.qualifiers.sort();
    }

    /// Canonical form with `/`, `:` and `@` replaced by `_`, usable as a directory name.
    pub fn path_safe(&self) -> String {
        self.to_string().replace(['/', ':', '@'], "_")
    }

    /// The name an installed package reports for itself, e.g. `@scope/name`.
    pub fn package_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

impl FromStr for Purl {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self> {
        Purl::parse(s)
    }
}

impl fmt::Display for Purl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pkg:{}/", self.ty)?;
        if let Some(ns) = &self.namespace {
            for seg in ns.split('/') {
                write!(f, "{}/", encode(seg))?;
            }
        }
        write!(f, "{}", encode(&self.name))?;
        if let Some(v) = &self.version {
            write!(f, "@{}", encode(v))?;
        }
        if !self.qualifiers.is_empty() {
            let q: Vec<String> = self
                .qualifiers
                .iter()
                .map(|(k, v)| format!("{}={}", k, encode(v)))
                .collect();
            write!(f, "?{}", q.join("&"))?;
        }
        if let Some(sub) = &self.subpath {
            write!(f, "#{}", sub)?;
        }
        Ok(())
    }
}

/// Parse and render in canonical form.
pub fn normalize(input: &str) -> Result<String> {
    Purl::parse(input).map(|p| p.to_string())
}

fn parse_qualifiers(q: &str) -> Vec<(String, String)> {
    q.split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .map(|(k, v)| (k.to_ascii_lowercase(), decode(v)))
        .collect()
}

fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b'~' | b'+') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
