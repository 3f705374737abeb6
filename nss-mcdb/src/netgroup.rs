//! Netgroup parsing and flattening.
//!
//! A netgroup file is lines of `NAME rule ...` where a rule is either a
//! `(host,user,domain)` triple (any field may be empty) or the name of
//! another netgroup. Blank lines and `#` comments are skipped; a backslash
//! before the newline continues a line.
//!
//! Parsing interns every distinct triple and every group name into
//! content-addressed tables handing out small ids; a group's rules become a
//! list of signed ids, positive for triples and negative for subgroups.
//! Id 0 is reserved on both tables (the catch-all triple `(,,)` and the
//! empty group name) so the sign encoding stays unambiguous.
//!
//! Writing the database flattens each group to the concatenation of its
//! triples' encodings, recursing through subgroups. Most groups have no
//! subgroups and take a plain path with no bookkeeping; once a subgroup
//! appears, a seen-set guards every id so duplicates collapse and cycles
//! terminate. Two zero bytes, a zero-length triple header, end each
//! membership list.
//!
//! A triple encodes as: u16 BE total length (header included), u8 host
//! length, u8 user length, then host, user, domain, each NUL-terminated
//! and simply absent when empty. Host and domain are folded to lowercase
//! so membership comparison is case-insensitive where DNS is.

use std::collections::HashMap;

use mcdb::make::Maker;

use crate::codec::fill;
use crate::db::{NssDb, TAG_CANONICAL};
use crate::error::{NssError, Result};

const FIELD_MAX: usize = 255;

fn encode_triple(host: &str, user: &str, domain: &str) -> Result<Vec<u8>> {
    if host.len() > FIELD_MAX || user.len() > FIELD_MAX || domain.len() > FIELD_MAX {
        return Err(NssError::InvalidInput("netgroup field too long"));
    }
    let room = |s: &str| if s.is_empty() { 0 } else { s.len() + 1 };
    let total = 4 + room(host) + room(user) + room(domain);

    let mut out = Vec::with_capacity(total);
    out.push((total >> 8) as u8);
    out.push(total as u8);
    out.push(host.len() as u8);
    out.push(user.len() as u8);
    if !host.is_empty() {
        out.extend(host.bytes().map(|b| b.to_ascii_lowercase()));
        out.push(0);
    }
    if !user.is_empty() {
        out.extend_from_slice(user.as_bytes());
        out.push(0);
    }
    if !domain.is_empty() {
        out.extend(domain.bytes().map(|b| b.to_ascii_lowercase()));
        out.push(0);
    }
    Ok(out)
}

/// Content-addressed byte strings: each distinct key gets the next id,
/// retrievable again in id order.
struct Table {
    ids: HashMap<Vec<u8>, i32>,
    keys: Vec<Vec<u8>>,
}

impl Table {
    fn new() -> Table {
        Table {
            ids: HashMap::new(),
            keys: Vec::new(),
        }
    }

    fn intern(&mut self, key: &[u8]) -> Result<i32> {
        if let Some(&id) = self.ids.get(key) {
            return Ok(id);
        }
        if self.keys.len() >= i32::max_value() as usize {
            return Err(NssError::InvalidInput("netgroup table overflow"));
        }
        let id = self.keys.len() as i32;
        self.ids.insert(key.to_vec(), id);
        self.keys.push(key.to_vec());
        Ok(id)
    }

    fn key(&self, id: i32) -> &[u8] {
        &self.keys[id as usize]
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Duplicate and cycle guard used while flattening a group that contains
/// subgroups: a power-of-two number of rows, each a bucket of up to 64
/// ids, doubling (by four) and rehashing whenever a bucket fills. Cleared
/// between groups by zeroing the per-row counts only.
struct SeenSet {
    rows: Vec<i32>,
    used: Vec<u32>,
    nrows: usize,
}

const ROW: usize = 64;

impl SeenSet {
    fn new() -> SeenSet {
        SeenSet {
            rows: Vec::new(),
            used: Vec::new(),
            nrows: 0,
        }
    }

    fn clear(&mut self) {
        for u in &mut self.used {
            *u = 0;
        }
    }

    fn grow(&mut self) {
        let nrows = if self.nrows == 0 { 64 } else { self.nrows * 4 };
        let mut rows = vec![0i32; nrows * ROW];
        let mut used = vec![0u32; nrows];
        for r in 0..self.nrows {
            for j in 0..self.used[r] as usize {
                let id = self.rows[r * ROW + j];
                let nr = (id & (nrows as i32 - 1)) as usize;
                // entries of one new row all come from one old row, so the
                // new bucket cannot overflow during the rehash
                rows[nr * ROW + used[nr] as usize] = id;
                used[nr] += 1;
            }
        }
        self.rows = rows;
        self.used = used;
        self.nrows = nrows;
    }

    /// Mark `id`; false when it was already present.
    fn insert(&mut self, id: i32) -> bool {
        if self.nrows == 0 {
            self.grow();
        }
        let mut row = (id & (self.nrows as i32 - 1)) as usize;
        let used = self.used[row] as usize;
        if self.rows[row * ROW..row * ROW + used].contains(&id) {
            return false;
        }
        while self.used[row] as usize == ROW {
            // a resize may leave this id's new bucket full again
            self.grow();
            row = (id & (self.nrows as i32 - 1)) as usize;
        }
        self.rows[row * ROW + self.used[row] as usize] = id;
        self.used[row] += 1;
        true
    }
}

/// Parsed netgroup file: interned names and triples plus the per-group
/// rule lists. Real group ids start at 1.
pub struct Netgroups {
    names: Table,
    triples: Table,
    rules: Vec<Vec<i32>>,
}

struct Parser<'a> {
    src: &'a str,
    s: &'a [u8],
    pos: usize,
    ng: Netgroups,
}

impl Netgroups {
    pub fn parse(src: &str) -> Result<Netgroups> {
        let mut ng = Netgroups {
            names: Table::new(),
            triples: Table::new(),
            rules: Vec::new(),
        };
        // reserve id 0 on both tables so the signed rule encoding stays
        // unambiguous: the catch-all triple (,,) and the empty group name
        ng.triples.intern(&encode_triple("", "", "")?)?;
        ng.group_id(b"")?;

        let parser = Parser {
            src,
            s: src.as_bytes(),
            pos: 0,
            ng,
        };
        parser.run()
    }

    fn group_id(&mut self, name: &[u8]) -> Result<i32> {
        let id = self.names.intern(name)?;
        while self.rules.len() <= id as usize {
            self.rules.push(Vec::new());
        }
        Ok(id)
    }

    fn triple_id(&mut self, host: &str, user: &str, domain: &str) -> Result<i32> {
        self.triples.intern(&encode_triple(host, user, domain)?)
    }

    /// Group names in definition order (reserved id 0 excluded).
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.names
            .keys
            .iter()
            .skip(1)
            .filter_map(|k| std::str::from_utf8(k).ok())
    }

    /// Encoded, flattened membership of one group, terminator included;
    /// `None` for an unknown name.
    pub fn expand_group(&self, name: &str) -> Option<Vec<u8>> {
        let id = *self.names.ids.get(name.as_bytes())?;
        if id == 0 {
            return None;
        }
        let mut seen = SeenSet::new();
        let mut out = Vec::new();
        self.expand(id, &mut seen, &mut out);
        out.extend_from_slice(&[0, 0]);
        Some(out)
    }

    /// Flatten every group into `maker`, one record per non-empty group,
    /// keyed by the group name.
    pub fn write(&self, maker: &mut Maker) -> Result<()> {
        let mut seen = SeenSet::new();
        let mut out = Vec::new();
        let mut emitted = 0usize;
        for id in 1..self.names.len() as i32 {
            out.clear();
            self.expand(id, &mut seen, &mut out);
            if out.is_empty() {
                continue;
            }
            out.extend_from_slice(&[0, 0]);
            maker.add(TAG_CANONICAL, self.names.key(id), &out)?;
            emitted += 1;
        }
        debug!(
            "netgroups: {} of {} groups flattened",
            emitted,
            self.names.len() - 1
        );
        Ok(())
    }

    fn expand(&self, gid: i32, seen: &mut SeenSet, out: &mut Vec<u8>) {
        let rules = &self.rules[gid as usize];
        if rules.iter().all(|&r| r >= 0) {
            // no subgroups: append directly, no duplicate tracking
            for &r in rules {
                out.extend_from_slice(self.triples.key(r));
            }
            return;
        }

        seen.clear();
        seen.insert(-gid);
        // explicit stack of (group, next rule index) bounds the depth on
        // hostile inputs; the seen-set prunes cycles
        let mut stack: Vec<(usize, usize)> = vec![(gid as usize, 0)];
        while let Some((g, mut at)) = stack.pop() {
            let rules = &self.rules[g];
            while at < rules.len() {
                let r = rules[at];
                at += 1;
                if !seen.insert(r) {
                    continue;
                }
                if r >= 0 {
                    out.extend_from_slice(self.triples.key(r));
                } else {
                    stack.push((g, at));
                    stack.push(((-r) as usize, 0));
                    break;
                }
            }
        }
    }
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.s.get(self.pos).copied()
    }

    // linear whitespace, treating backslash-newline as a continuation
    fn skip_ws_cont(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') => self.pos += 1,
                Some(b'\\') => match (self.s.get(self.pos + 1), self.s.get(self.pos + 2)) {
                    (Some(b'\n'), _) => self.pos += 2,
                    (Some(b'\r'), Some(b'\n')) => self.pos += 3,
                    _ => break,
                },
                _ => break,
            }
        }
    }

    fn skip_line(&mut self) {
        while !matches!(self.peek(), None | Some(b'\n') | Some(b'\r')) {
            self.pos += 1;
        }
    }

    fn name_token(&mut self) -> Result<&'a str> {
        let start = self.pos;
        match self.peek() {
            Some(b) if b.is_ascii_alphanumeric() || b == b'_' => self.pos += 1,
            _ => return Err(NssError::InvalidInput("netgroup: bad token")),
        }
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(&self.src[start..self.pos])
    }

    // one triple field up to `term` (',' or ')'), possibly empty
    fn triple_field(&mut self, term: u8) -> Result<&'a str> {
        self.skip_ws_cont();
        match self.peek() {
            None | Some(b'\\') => {
                return Err(NssError::InvalidInput("netgroup: malformed triple"))
            }
            Some(b) if b == term => {
                self.pos += 1;
                return Ok("");
            }
            _ => (),
        }
        let token = self.name_token()?;
        self.skip_ws_cont();
        if self.peek() != Some(term) {
            return Err(NssError::InvalidInput("netgroup: malformed triple"));
        }
        self.pos += 1;
        Ok(token)
    }

    fn parse_rules(&mut self, gid: usize) -> Result<()> {
        loop {
            self.skip_ws_cont();
            match self.peek() {
                None | Some(b'\n') | Some(b'\r') => return Ok(()),
                Some(b'\\') => {
                    return Err(NssError::InvalidInput("netgroup: stray continuation"))
                }
                Some(b'(') => {
                    self.pos += 1;
                    let host = self.triple_field(b',')?;
                    let user = self.triple_field(b',')?;
                    let domain = self.triple_field(b')')?;
                    let id = self.ng.triple_id(host, user, domain)?;
                    self.ng.rules[gid].push(id);
                }
                Some(_) => {
                    let name = self.name_token()?;
                    let id = self.ng.group_id(name.as_bytes())?;
                    self.ng.rules[gid].push(-id);
                }
            }
        }
    }

    fn run(mut self) -> Result<Netgroups> {
        while self.pos < self.s.len() {
            // skip blank lines and comment lines (comments may themselves
            // end in a continuation)
            loop {
                if self.peek() == Some(b'\r') {
                    self.pos += 1;
                }
                if self.peek() == Some(b'\n') {
                    self.pos += 1;
                }
                if self.peek() == Some(b'#') {
                    loop {
                        self.skip_line();
                        if self.peek().is_none() || self.s[self.pos - 1] != b'\\' {
                            break;
                        }
                        if self.peek() == Some(b'\r') {
                            self.pos += 1;
                        }
                        if self.peek() == Some(b'\n') {
                            self.pos += 1;
                        }
                    }
                }
                if !matches!(self.peek(), Some(b'\n') | Some(b'\r')) {
                    break;
                }
            }
            if self.peek().is_none() {
                break;
            }

            let name = self.name_token()?;
            match self.peek() {
                Some(b' ') | Some(b'\t') => self.pos += 1,
                Some(b'\\') => (),
                // a name with no rules defines nothing; skip the line
                _ => {
                    self.skip_line();
                    continue;
                }
            }
            let gid = self.ng.group_id(name.as_bytes())? as usize;
            self.parse_rules(gid)?;
        }
        Ok(self.ng)
    }
}

/// Walk the triples of one flattened membership value.
#[derive(Clone, Copy, Debug)]
pub struct NetgroupIter<'a> {
    data: &'a [u8],
}

impl<'a> NetgroupIter<'a> {
    pub fn new(data: &'a [u8]) -> NetgroupIter<'a> {
        NetgroupIter { data }
    }
}

impl<'a> Iterator for NetgroupIter<'a> {
    /// (host, user, domain); an empty field is the wildcard
    type Item = (&'a str, &'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        let d = self.data;
        if d.len() < 4 {
            // a zero-length header (two zero bytes) ends the list
            return None;
        }
        let total = (usize::from(d[0]) << 8) | usize::from(d[1]);
        if total < 4 || total > d.len() {
            return None;
        }
        let hlen = usize::from(d[2]);
        let ulen = usize::from(d[3]);
        let body = &d[..total];
        let mut at = 4;

        let mut field = |len: usize| -> Option<&'a [u8]> {
            if len == 0 {
                return Some(b"");
            }
            let f = body.get(at..at + len)?;
            at += len + 1;
            Some(f)
        };
        let host = field(hlen)?;
        let user = field(ulen)?;
        let domain = if at < total {
            body.get(at..total - 1)?
        } else {
            b""
        };

        self.data = &d[total..];
        Some((
            std::str::from_utf8(host).ok()?,
            std::str::from_utf8(user).ok()?,
            std::str::from_utf8(domain).ok()?,
        ))
    }
}

/// Look up a netgroup's flattened membership.
pub fn netgroup_by_name<'b>(db: &NssDb, name: &str, buf: &'b mut [u8]) -> Result<NetgroupIter<'b>> {
    db.lookup(TAG_CANONICAL, name.as_bytes(), buf, |_, _, v, buf| {
        Ok(NetgroupIter::new(fill(buf, v)?))
    })
}
