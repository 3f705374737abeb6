//! Network databases: hosts, networks, protocols, rpc, services.
//!
//! Every entry is keyed by canonical name (`=`), by each alias (`~`), and
//! by the printable hex form of its number (`x`); hosts are additionally
//! keyed by the raw binary address (`b`) next to its hex rendering. Host and
//! service lookups are secondary-filtered: the record found by key is only
//! accepted once its address family, or its protocol string, matches what
//! the caller asked for; otherwise the scan continues along the bucket.
//!
//! Deserializing these five record kinds shares a lot of near-identical
//! code; protocols and rpc are byte-identical layouts and share one
//! implementation, the rest differ just enough to stay separate.

use mcdb::dbfile::{Cursor, Db};
use mcdb::make::Maker;

use crate::codec::{
    cstr, fill, get_u16, get_u32, hex8_key, push_cstr, push_list, put_u16, put_u32, str_region,
    u16_of, Addrs, Members,
};
use crate::db::{Entries, NssDb, TAG_ALIAS, TAG_BINARY, TAG_CANONICAL, TAG_HEX};
use crate::error::{NssError, Result};

/// Address families as stored in host and network records.
pub const AF_UNSPEC: u32 = 0;
pub const AF_INET: u32 = 2;
pub const AF_INET6: u32 = 10;

// host value header
const H_ADDRTYPE: usize = 0;
const H_LENGTH: usize = 8;
const HE_MEM_STR: usize = 16;
const HE_LST_STR: usize = 20;
const HE_MEM: usize = 24;
const HE_MEM_NUM: usize = 28;
const HE_LST_NUM: usize = 32;
const HE_HDRSZ: usize = 36;

// network value header
const N_NET: usize = 0;
const N_ADDRTYPE: usize = 8;
const NE_MEM_STR: usize = 16;
const NE_MEM: usize = 20;
const NE_MEM_NUM: usize = 24;
const NE_HDRSZ: usize = 28;

// protocol and rpc value header (identical layouts)
const NUM_NUMBER: usize = 0;
const NUM_MEM_STR: usize = 8;
const NUM_MEM: usize = 12;
const NUM_MEM_NUM: usize = 16;
const NUM_HDRSZ: usize = 20;

// service value header
const S_PORT: usize = 0;
const S_NAME: usize = 8;
const SE_MEM_STR: usize = 12;
const SE_MEM: usize = 16;
const SE_MEM_NUM: usize = 20;
const SE_HDRSZ: usize = 24;

#[derive(Debug, PartialEq)]
pub struct Host<'a> {
    pub name: &'a str,
    pub aliases: Members<'a>,
    pub addrtype: u32,
    pub length: u32,
    pub addrs: Addrs<'a>,
}

#[derive(Debug, PartialEq)]
pub struct Network<'a> {
    pub name: &'a str,
    pub aliases: Members<'a>,
    pub net: u32,
    pub addrtype: u32,
}

#[derive(Debug, PartialEq)]
pub struct Protocol<'a> {
    pub name: &'a str,
    pub aliases: Members<'a>,
    pub number: u32,
}

#[derive(Debug, PartialEq)]
pub struct Rpc<'a> {
    pub name: &'a str,
    pub aliases: Members<'a>,
    pub number: u32,
}

#[derive(Debug, PartialEq)]
pub struct Service<'a> {
    pub name: &'a str,
    pub proto: &'a str,
    pub aliases: Members<'a>,
    pub port: u16,
}

fn addr_width(family: u32) -> Result<usize> {
    match family {
        AF_INET => Ok(4),
        AF_INET6 => Ok(16),
        _ => Err(NssError::Unavailable),
    }
}

// printable uppercase hex of a binary address (8 chars for IPv4, 32 for
// IPv6), the `x`-tagged twin of the raw `b` key
fn hex_addr_key(addr: &[u8]) -> Vec<u8> {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = Vec::with_capacity(addr.len() * 2);
    for &b in addr {
        out.push(HEX[usize::from(b >> 4)]);
        out.push(HEX[usize::from(b & 0xF)]);
    }
    out
}

// hosts

fn host_value(he: &Host) -> Result<Vec<u8>> {
    let width = addr_width(he.addrtype)
        .map_err(|_| NssError::InvalidInput("unsupported host address family"))?;
    if he.length as usize != width {
        return Err(NssError::InvalidInput("host address length does not match family"));
    }
    let mem_str_ofs = he.name.len() + 1;

    let mut out = vec![0u8; HE_HDRSZ];
    push_cstr(&mut out, he.name)?;
    let count = push_list(&mut out, &he.aliases)?;
    let lst_str_ofs = out.len() - HE_HDRSZ;
    let mut lst_num = 0usize;
    for addr in he.addrs.iter() {
        if addr.len() != width {
            return Err(NssError::InvalidInput("host address length does not match family"));
        }
        out.extend_from_slice(addr);
        lst_num += 1;
    }
    let total = out.len() - HE_HDRSZ;

    put_u32(&mut out, H_ADDRTYPE, he.addrtype);
    put_u32(&mut out, H_LENGTH, he.length);
    put_u16(&mut out, HE_MEM_STR, u16_of(mem_str_ofs, "host entry too long")?);
    put_u16(&mut out, HE_LST_STR, u16_of(lst_str_ofs, "host entry too long")?);
    put_u16(&mut out, HE_MEM, u16_of(total, "host entry too long")?);
    put_u16(&mut out, HE_MEM_NUM, count);
    put_u16(&mut out, HE_LST_NUM, u16_of(lst_num, "too many host addresses")?);
    Ok(out)
}

/// Insert one host under its canonical name, the enumeration sentinel,
/// each alias, and each address both raw (`b`) and as hex (`x`).
pub fn add_host(maker: &mut Maker, he: &Host) -> Result<()> {
    let value = host_value(he)?;
    maker.add(TAG_CANONICAL, he.name.as_bytes(), &value)?;
    maker.add(TAG_ALIAS, b"", &value)?;
    for alias in he.aliases.iter() {
        maker.add(TAG_ALIAS, alias.as_bytes(), &value)?;
    }
    for addr in he.addrs.iter() {
        maker.add(TAG_BINARY, addr, &value)?;
        maker.add(TAG_HEX, &hex_addr_key(addr), &value)?;
    }
    Ok(())
}

pub fn decode_host<'b>(value: &[u8], buf: &'b mut [u8]) -> Result<Host<'b>> {
    if value.len() < HE_HDRSZ {
        return Err(NssError::Unavailable);
    }
    let addrtype = get_u32(value, H_ADDRTYPE)?;
    let length = get_u32(value, H_LENGTH)?;
    let mem_str_ofs = usize::from(get_u16(value, HE_MEM_STR)?);
    let lst_str_ofs = usize::from(get_u16(value, HE_LST_STR)?);
    let total = usize::from(get_u16(value, HE_MEM)?);
    let mem_num = usize::from(get_u16(value, HE_MEM_NUM)?);
    let lst_num = usize::from(get_u16(value, HE_LST_NUM)?);

    let region = fill(buf, &value[HE_HDRSZ..])?;
    if lst_str_ofs > total || total != region.len() || length == 0 {
        return Err(NssError::Unavailable);
    }
    let addr_bytes = &region[lst_str_ofs..];
    if addr_bytes.len() != lst_num * length as usize {
        return Err(NssError::Unavailable);
    }
    let aliases = region
        .get(mem_str_ofs..lst_str_ofs)
        .ok_or(NssError::Unavailable)?;
    Ok(Host {
        name: cstr(region, 0)?,
        aliases: Members::packed(str_region(aliases)?, mem_num),
        addrtype,
        length,
        addrs: Addrs::packed(addr_bytes, length as usize),
    })
}

// accept the found record only when its family matches; keep scanning the
// bucket otherwise (AF_UNSPEC accepts anything)
fn decode_host_filtered<'v, 'b>(
    db: &'v Db,
    cur: &mut Cursor,
    tag: u8,
    key: &[u8],
    first: &'v [u8],
    family: u32,
    buf: &'b mut [u8],
) -> Result<Host<'b>> {
    let mut value = first;
    if family != AF_UNSPEC {
        while value.len() < HE_HDRSZ || get_u32(value, H_ADDRTYPE)? != family {
            value = db.find_next(cur, tag, key).ok_or(NssError::NotFound)?;
        }
    }
    decode_host(value, buf)
}

/// Look a host up by canonical name or alias, filtered by address family
/// (`AF_UNSPEC` for any).
pub fn host_by_name<'b>(
    db: &NssDb,
    name: &str,
    family: u32,
    buf: &'b mut [u8],
) -> Result<Host<'b>> {
    let key = name.as_bytes();
    let snap = db.snapshot();
    let snap: &Db = &snap;
    let mut cur = Cursor::new();
    for &tag in &[TAG_CANONICAL, TAG_ALIAS] {
        if !snap.find_start(&mut cur, tag, key) {
            continue;
        }
        if let Some(value) = snap.find_next(&mut cur, tag, key) {
            return decode_host_filtered(snap, &mut cur, tag, key, value, family, buf);
        }
    }
    Err(NssError::NotFound)
}

/// Look a host up by binary address. The family selects the expected
/// address width; an unsupported family reports `Unavailable`.
pub fn host_by_addr<'b>(
    db: &NssDb,
    addr: &[u8],
    family: u32,
    buf: &'b mut [u8],
) -> Result<Host<'b>> {
    if addr.len() != addr_width(family)? {
        return Err(NssError::InvalidInput("address length does not match family"));
    }
    let key = hex_addr_key(addr);
    db.lookup(TAG_HEX, &key, buf, |db, cur, v, buf| {
        decode_host_filtered(db, cur, TAG_HEX, &key, v, family, buf)
    })
}

pub fn next_host<'b>(entries: &mut Entries, buf: &'b mut [u8]) -> Result<Option<Host<'b>>> {
    entries.next_with(buf, |v, buf| decode_host(v, buf))
}

// networks

fn network_value(ne: &Network) -> Result<Vec<u8>> {
    let mem_str_ofs = ne.name.len() + 1;

    let mut out = vec![0u8; NE_HDRSZ];
    push_cstr(&mut out, ne.name)?;
    let count = push_list(&mut out, &ne.aliases)?;
    let total = out.len() - NE_HDRSZ;

    put_u32(&mut out, N_NET, ne.net);
    put_u32(&mut out, N_ADDRTYPE, ne.addrtype);
    put_u16(&mut out, NE_MEM_STR, u16_of(mem_str_ofs, "network entry too long")?);
    put_u16(&mut out, NE_MEM, u16_of(total, "network entry too long")?);
    put_u16(&mut out, NE_MEM_NUM, count);
    Ok(out)
}

/// Insert one network under its name, the enumeration sentinel, each
/// alias, and its network number.
pub fn add_network(maker: &mut Maker, ne: &Network) -> Result<()> {
    let value = network_value(ne)?;
    maker.add(TAG_CANONICAL, ne.name.as_bytes(), &value)?;
    maker.add(TAG_ALIAS, b"", &value)?;
    for alias in ne.aliases.iter() {
        maker.add(TAG_ALIAS, alias.as_bytes(), &value)?;
    }
    maker.add(TAG_HEX, &hex8_key(ne.net), &value)?;
    Ok(())
}

pub fn decode_network<'b>(value: &[u8], buf: &'b mut [u8]) -> Result<Network<'b>> {
    if value.len() < NE_HDRSZ {
        return Err(NssError::Unavailable);
    }
    let net = get_u32(value, N_NET)?;
    let addrtype = get_u32(value, N_ADDRTYPE)?;
    let mem_str_ofs = usize::from(get_u16(value, NE_MEM_STR)?);
    let total = usize::from(get_u16(value, NE_MEM)?);
    let count = usize::from(get_u16(value, NE_MEM_NUM)?);
    let region = fill(buf, &value[NE_HDRSZ..])?;
    let aliases = region.get(mem_str_ofs..total).ok_or(NssError::Unavailable)?;
    Ok(Network {
        name: cstr(region, 0)?,
        aliases: Members::packed(str_region(aliases)?, count),
        net,
        addrtype,
    })
}

pub fn network_by_name<'b>(db: &NssDb, name: &str, buf: &'b mut [u8]) -> Result<Network<'b>> {
    let key = name.as_bytes();
    let snap = db.snapshot();
    let snap: &Db = &snap;
    let mut cur = Cursor::new();
    for &tag in &[TAG_CANONICAL, TAG_ALIAS] {
        if !snap.find_start(&mut cur, tag, key) {
            continue;
        }
        if let Some(value) = snap.find_next(&mut cur, tag, key) {
            return decode_network(value, buf);
        }
    }
    Err(NssError::NotFound)
}

pub fn network_by_addr<'b>(db: &NssDb, net: u32, buf: &'b mut [u8]) -> Result<Network<'b>> {
    db.lookup(TAG_HEX, &hex8_key(net), buf, |_, _, v, buf| {
        decode_network(v, buf)
    })
}

pub fn next_network<'b>(entries: &mut Entries, buf: &'b mut [u8]) -> Result<Option<Network<'b>>> {
    entries.next_with(buf, |v, buf| decode_network(v, buf))
}

// protocols and rpc (one layout, two databases)

fn numbered_value(name: &str, aliases: &Members, number: u32) -> Result<Vec<u8>> {
    let mem_str_ofs = name.len() + 1;

    let mut out = vec![0u8; NUM_HDRSZ];
    push_cstr(&mut out, name)?;
    let count = push_list(&mut out, aliases)?;
    let total = out.len() - NUM_HDRSZ;

    put_u32(&mut out, NUM_NUMBER, number);
    put_u16(&mut out, NUM_MEM_STR, u16_of(mem_str_ofs, "entry too long")?);
    put_u16(&mut out, NUM_MEM, u16_of(total, "entry too long")?);
    put_u16(&mut out, NUM_MEM_NUM, count);
    Ok(out)
}

fn add_numbered(maker: &mut Maker, name: &str, aliases: &Members, number: u32) -> Result<()> {
    let value = numbered_value(name, aliases, number)?;
    maker.add(TAG_CANONICAL, name.as_bytes(), &value)?;
    maker.add(TAG_ALIAS, b"", &value)?;
    for alias in aliases.iter() {
        maker.add(TAG_ALIAS, alias.as_bytes(), &value)?;
    }
    maker.add(TAG_HEX, &hex8_key(number), &value)?;
    Ok(())
}

fn decode_numbered<'b>(value: &[u8], buf: &'b mut [u8]) -> Result<(&'b str, Members<'b>, u32)> {
    if value.len() < NUM_HDRSZ {
        return Err(NssError::Unavailable);
    }
    let number = get_u32(value, NUM_NUMBER)?;
    let mem_str_ofs = usize::from(get_u16(value, NUM_MEM_STR)?);
    let total = usize::from(get_u16(value, NUM_MEM)?);
    let count = usize::from(get_u16(value, NUM_MEM_NUM)?);
    let region = fill(buf, &value[NUM_HDRSZ..])?;
    let aliases = region.get(mem_str_ofs..total).ok_or(NssError::Unavailable)?;
    Ok((
        cstr(region, 0)?,
        Members::packed(str_region(aliases)?, count),
        number,
    ))
}

fn numbered_by_name<'b>(
    db: &NssDb,
    name: &str,
    buf: &'b mut [u8],
) -> Result<(&'b str, Members<'b>, u32)> {
    let key = name.as_bytes();
    let snap = db.snapshot();
    let snap: &Db = &snap;
    let mut cur = Cursor::new();
    for &tag in &[TAG_CANONICAL, TAG_ALIAS] {
        if !snap.find_start(&mut cur, tag, key) {
            continue;
        }
        if let Some(value) = snap.find_next(&mut cur, tag, key) {
            return decode_numbered(value, buf);
        }
    }
    Err(NssError::NotFound)
}

pub fn add_protocol(maker: &mut Maker, pe: &Protocol) -> Result<()> {
    add_numbered(maker, pe.name, &pe.aliases, pe.number)
}

pub fn decode_protocol<'b>(value: &[u8], buf: &'b mut [u8]) -> Result<Protocol<'b>> {
    let (name, aliases, number) = decode_numbered(value, buf)?;
    Ok(Protocol {
        name,
        aliases,
        number,
    })
}

pub fn protocol_by_name<'b>(db: &NssDb, name: &str, buf: &'b mut [u8]) -> Result<Protocol<'b>> {
    let (name, aliases, number) = numbered_by_name(db, name, buf)?;
    Ok(Protocol {
        name,
        aliases,
        number,
    })
}

pub fn protocol_by_number<'b>(db: &NssDb, number: u32, buf: &'b mut [u8]) -> Result<Protocol<'b>> {
    db.lookup(TAG_HEX, &hex8_key(number), buf, |_, _, v, buf| {
        decode_protocol(v, buf)
    })
}

pub fn next_protocol<'b>(entries: &mut Entries, buf: &'b mut [u8]) -> Result<Option<Protocol<'b>>> {
    entries.next_with(buf, |v, buf| decode_protocol(v, buf))
}

pub fn add_rpc(maker: &mut Maker, re: &Rpc) -> Result<()> {
    add_numbered(maker, re.name, &re.aliases, re.number)
}

pub fn decode_rpc<'b>(value: &[u8], buf: &'b mut [u8]) -> Result<Rpc<'b>> {
    let (name, aliases, number) = decode_numbered(value, buf)?;
    Ok(Rpc {
        name,
        aliases,
        number,
    })
}

pub fn rpc_by_name<'b>(db: &NssDb, name: &str, buf: &'b mut [u8]) -> Result<Rpc<'b>> {
    let (name, aliases, number) = numbered_by_name(db, name, buf)?;
    Ok(Rpc {
        name,
        aliases,
        number,
    })
}

pub fn rpc_by_number<'b>(db: &NssDb, number: u32, buf: &'b mut [u8]) -> Result<Rpc<'b>> {
    db.lookup(TAG_HEX, &hex8_key(number), buf, |_, _, v, buf| {
        decode_rpc(v, buf)
    })
}

pub fn next_rpc<'b>(entries: &mut Entries, buf: &'b mut [u8]) -> Result<Option<Rpc<'b>>> {
    entries.next_with(buf, |v, buf| decode_rpc(v, buf))
}

// services

fn service_value(se: &Service) -> Result<Vec<u8>> {
    // proto is the first string so the filter can match without decoding
    let name_ofs = se.proto.len() + 1;
    let mem_str_ofs = name_ofs + se.name.len() + 1;

    let mut out = vec![0u8; SE_HDRSZ];
    push_cstr(&mut out, se.proto)?;
    push_cstr(&mut out, se.name)?;
    let count = push_list(&mut out, &se.aliases)?;
    let total = out.len() - SE_HDRSZ;

    put_u32(&mut out, S_PORT, u32::from(se.port));
    put_u16(&mut out, S_NAME, u16_of(name_ofs, "service entry too long")?);
    put_u16(&mut out, SE_MEM_STR, u16_of(mem_str_ofs, "service entry too long")?);
    put_u16(&mut out, SE_MEM, u16_of(total, "service entry too long")?);
    put_u16(&mut out, SE_MEM_NUM, count);
    Ok(out)
}

/// Insert one service under its name, the enumeration sentinel, each
/// alias, and its port number.
pub fn add_service(maker: &mut Maker, se: &Service) -> Result<()> {
    let value = service_value(se)?;
    maker.add(TAG_CANONICAL, se.name.as_bytes(), &value)?;
    maker.add(TAG_ALIAS, b"", &value)?;
    for alias in se.aliases.iter() {
        maker.add(TAG_ALIAS, alias.as_bytes(), &value)?;
    }
    maker.add(TAG_HEX, &hex8_key(u32::from(se.port)), &value)?;
    Ok(())
}

pub fn decode_service<'b>(value: &[u8], buf: &'b mut [u8]) -> Result<Service<'b>> {
    if value.len() < SE_HDRSZ {
        return Err(NssError::Unavailable);
    }
    let port = get_u32(value, S_PORT)?;
    let name_ofs = usize::from(get_u16(value, S_NAME)?);
    let mem_str_ofs = usize::from(get_u16(value, SE_MEM_STR)?);
    let total = usize::from(get_u16(value, SE_MEM)?);
    let count = usize::from(get_u16(value, SE_MEM_NUM)?);
    let region = fill(buf, &value[SE_HDRSZ..])?;
    let aliases = region.get(mem_str_ofs..total).ok_or(NssError::Unavailable)?;
    Ok(Service {
        proto: cstr(region, 0)?,
        name: cstr(region, name_ofs)?,
        aliases: Members::packed(str_region(aliases)?, count),
        port: port as u16,
    })
}

// proto sits right after the header, so the match touches only the record
fn service_proto_matches(value: &[u8], proto: &[u8]) -> bool {
    match value.get(SE_HDRSZ..SE_HDRSZ + proto.len() + 1) {
        Some(window) => &window[..proto.len()] == proto && window[proto.len()] == 0,
        None => false,
    }
}

fn decode_service_filtered<'v, 'b>(
    db: &'v Db,
    cur: &mut Cursor,
    tag: u8,
    key: &[u8],
    first: &'v [u8],
    proto: &str,
    buf: &'b mut [u8],
) -> Result<Service<'b>> {
    let mut value = first;
    if !proto.is_empty() {
        while !service_proto_matches(value, proto.as_bytes()) {
            value = db.find_next(cur, tag, key).ok_or(NssError::NotFound)?;
        }
    }
    decode_service(value, buf)
}

/// Look a service up by name or alias; `proto` restricts the protocol
/// ("" accepts any).
pub fn service_by_name<'b>(
    db: &NssDb,
    name: &str,
    proto: &str,
    buf: &'b mut [u8],
) -> Result<Service<'b>> {
    let key = name.as_bytes();
    let snap = db.snapshot();
    let snap: &Db = &snap;
    let mut cur = Cursor::new();
    for &tag in &[TAG_CANONICAL, TAG_ALIAS] {
        if !snap.find_start(&mut cur, tag, key) {
            continue;
        }
        if let Some(value) = snap.find_next(&mut cur, tag, key) {
            return decode_service_filtered(snap, &mut cur, tag, key, value, proto, buf);
        }
    }
    Err(NssError::NotFound)
}

pub fn service_by_port<'b>(
    db: &NssDb,
    port: u16,
    proto: &str,
    buf: &'b mut [u8],
) -> Result<Service<'b>> {
    let key = hex8_key(u32::from(port));
    db.lookup(TAG_HEX, &key, buf, |db, cur, v, buf| {
        decode_service_filtered(db, cur, TAG_HEX, &key, v, proto, buf)
    })
}

pub fn next_service<'b>(entries: &mut Entries, buf: &'b mut [u8]) -> Result<Option<Service<'b>>> {
    entries.next_with(buf, |v, buf| decode_service(v, buf))
}
