//! Mail alias and ether (MAC address) databases.
//!
//! Aliases map a name to a member list. Ether records pair a hostname with
//! a 48-bit hardware address; the address is stored as its 12 uppercase hex
//! chars, which double as the printable `x` lookup key.

use mcdb::make::Maker;
use mcdb::utils::serialize::{read_hex4, read_hex8, write_hex4, write_hex8};

use crate::codec::{cstr, fill, get_u16, push_cstr, push_list, put_u16, str_region, u16_of, Members};
use crate::db::{Entries, NssDb, TAG_ALIAS, TAG_CANONICAL, TAG_HEX};
use crate::error::{NssError, Result};

// mail alias value header
const AE_MEM_STR: usize = 0;
const AE_MEM: usize = 4;
const AE_MEM_NUM: usize = 8;
const AE_HDRSZ: usize = 12;

// ether value: 12 hex chars of address, then the hostname
const EA_HDRSZ: usize = 12;

#[derive(Debug, PartialEq)]
pub struct MailAlias<'a> {
    pub name: &'a str,
    pub members: Members<'a>,
}

#[derive(Debug, PartialEq)]
pub struct Ether<'a> {
    pub name: &'a str,
    pub addr: [u8; 6],
}

// mail aliases

fn alias_value(ae: &MailAlias) -> Result<Vec<u8>> {
    let mem_str_ofs = ae.name.len() + 1;

    let mut out = vec![0u8; AE_HDRSZ];
    push_cstr(&mut out, ae.name)?;
    let count = push_list(&mut out, &ae.members)?;
    let total = out.len() - AE_HDRSZ;

    put_u16(&mut out, AE_MEM_STR, u16_of(mem_str_ofs, "alias entry too long")?);
    put_u16(&mut out, AE_MEM, u16_of(total, "alias entry too long")?);
    put_u16(&mut out, AE_MEM_NUM, count);
    Ok(out)
}

/// Insert one mail alias under its name and the enumeration sentinel.
pub fn add_alias(maker: &mut Maker, ae: &MailAlias) -> Result<()> {
    let value = alias_value(ae)?;
    maker.add(TAG_CANONICAL, ae.name.as_bytes(), &value)?;
    maker.add(TAG_ALIAS, b"", &value)?;
    Ok(())
}

pub fn decode_alias<'b>(value: &[u8], buf: &'b mut [u8]) -> Result<MailAlias<'b>> {
    if value.len() < AE_HDRSZ {
        return Err(NssError::Unavailable);
    }
    let mem_str_ofs = usize::from(get_u16(value, AE_MEM_STR)?);
    let total = usize::from(get_u16(value, AE_MEM)?);
    let count = usize::from(get_u16(value, AE_MEM_NUM)?);
    let region = fill(buf, &value[AE_HDRSZ..])?;
    let members = region.get(mem_str_ofs..total).ok_or(NssError::Unavailable)?;
    Ok(MailAlias {
        name: cstr(region, 0)?,
        members: Members::packed(str_region(members)?, count),
    })
}

pub fn alias_by_name<'b>(db: &NssDb, name: &str, buf: &'b mut [u8]) -> Result<MailAlias<'b>> {
    db.lookup(TAG_CANONICAL, name.as_bytes(), buf, |_, _, v, buf| {
        decode_alias(v, buf)
    })
}

pub fn next_alias<'b>(entries: &mut Entries, buf: &'b mut [u8]) -> Result<Option<MailAlias<'b>>> {
    entries.next_with(buf, |v, buf| decode_alias(v, buf))
}

// ethers

fn ether_hex(addr: &[u8; 6]) -> [u8; 12] {
    let hi = (u32::from(addr[0]) << 24)
        | (u32::from(addr[1]) << 16)
        | (u32::from(addr[2]) << 8)
        | u32::from(addr[3]);
    let lo = (u16::from(addr[4]) << 8) | u16::from(addr[5]);
    let mut hex = [0u8; 12];
    write_hex8(&mut hex[0..8], hi);
    write_hex4(&mut hex[8..12], lo);
    hex
}

fn ether_value(ea: &Ether) -> Result<Vec<u8>> {
    if ea.name.as_bytes().contains(&0) {
        return Err(NssError::InvalidInput("hostname contains NUL"));
    }
    let mut out = Vec::with_capacity(EA_HDRSZ + ea.name.len());
    out.extend_from_slice(&ether_hex(&ea.addr));
    out.extend_from_slice(ea.name.as_bytes());
    Ok(out)
}

/// Insert one ether record under its hostname, the enumeration sentinel,
/// and the hex form of its address.
pub fn add_ether(maker: &mut Maker, ea: &Ether) -> Result<()> {
    let value = ether_value(ea)?;
    maker.add(TAG_CANONICAL, ea.name.as_bytes(), &value)?;
    maker.add(TAG_ALIAS, b"", &value)?;
    maker.add(TAG_HEX, &ether_hex(&ea.addr), &value)?;
    Ok(())
}

pub fn decode_ether<'b>(value: &[u8], buf: &'b mut [u8]) -> Result<Ether<'b>> {
    if value.len() < EA_HDRSZ {
        return Err(NssError::Unavailable);
    }
    let hi = read_hex8(&value[0..8]);
    let lo = read_hex4(&value[8..12]);
    let addr = [
        (hi >> 24) as u8,
        (hi >> 16) as u8,
        (hi >> 8) as u8,
        hi as u8,
        (lo >> 8) as u8,
        lo as u8,
    ];
    let region = fill(buf, &value[EA_HDRSZ..])?;
    Ok(Ether {
        name: str_region(region)?,
        addr,
    })
}

pub fn ether_by_host<'b>(db: &NssDb, name: &str, buf: &'b mut [u8]) -> Result<Ether<'b>> {
    db.lookup(TAG_CANONICAL, name.as_bytes(), buf, |_, _, v, buf| {
        decode_ether(v, buf)
    })
}

pub fn ether_by_addr<'b>(db: &NssDb, addr: &[u8; 6], buf: &'b mut [u8]) -> Result<Ether<'b>> {
    db.lookup(TAG_HEX, &ether_hex(addr), buf, |_, _, v, buf| {
        decode_ether(v, buf)
    })
}

pub fn next_ether<'b>(entries: &mut Entries, buf: &'b mut [u8]) -> Result<Option<Ether<'b>>> {
    entries.next_with(buf, |v, buf| decode_ether(v, buf))
}
