//! Account databases: passwd, group, shadow.
//!
//! One logical entry becomes one packed value inserted under several keys:
//! the name under `=`, the enumeration sentinel under `~`, and the numeric
//! id (uid or gid) as 8 uppercase hex chars under `x`. The group builder
//! can additionally accumulate a per-user membership list of gids, stored
//! under the user name with tag `~` in the same file.
//!
//! Header layouts are part of the on-disk contract; the byte offsets below
//! are load-bearing.

use std::collections::HashMap;

use mcdb::make::Maker;

use crate::codec::{
    cstr, fill, get_u16, get_u32, hex8_key, push_cstr, push_list, put_u16, put_u32, str_region,
    u16_of, Members,
};
use crate::db::{Entries, NssDb, TAG_ALIAS, TAG_CANONICAL, TAG_HEX};
use crate::error::{NssError, Result};

// passwd value header
const PW_PASSWD: usize = 0;
const PW_GECOS: usize = 4;
const PW_DIR: usize = 8;
const PW_SHELL: usize = 12;
const PW_UID: usize = 16;
const PW_GID: usize = 24;
const PW_HDRSZ: usize = 32;

// group value header
const GR_PASSWD: usize = 0;
const GR_MEM_STR: usize = 4;
const GR_MEM: usize = 8;
const GR_MEM_NUM: usize = 12;
const GR_GID: usize = 16;
const GR_HDRSZ: usize = 24;

// shadow value header
const SP_LSTCHG: usize = 0;
const SP_MIN: usize = 8;
const SP_MAX: usize = 16;
const SP_WARN: usize = 24;
const SP_INACT: usize = 32;
const SP_EXPIRE: usize = 40;
const SP_FLAG: usize = 48;
const SP_PWDP: usize = 56;
const SP_HDRSZ: usize = 60;

// grouplist value header
const GL_NGROUPS: usize = 0;
const GL_HDRSZ: usize = 8;

#[derive(Debug, PartialEq)]
pub struct Passwd<'a> {
    pub name: &'a str,
    pub passwd: &'a str,
    pub uid: u32,
    pub gid: u32,
    pub gecos: &'a str,
    pub dir: &'a str,
    pub shell: &'a str,
}

#[derive(Debug, PartialEq)]
pub struct Group<'a> {
    pub name: &'a str,
    pub passwd: &'a str,
    pub gid: u32,
    pub members: Members<'a>,
}

/// Shadow numeric fields use -1 as the "empty" sentinel, stored as the
/// all-ones u32 and normalized back on decode.
#[derive(Debug, PartialEq)]
pub struct Shadow<'a> {
    pub name: &'a str,
    pub passwd: &'a str,
    pub lastchange: i64,
    pub min: i64,
    pub max: i64,
    pub warn: i64,
    pub inactive: i64,
    pub expire: i64,
    pub flag: i64,
}

// passwd

fn passwd_value(pw: &Passwd) -> Result<Vec<u8>> {
    let passwd_ofs = pw.name.len() + 1;
    let gecos_ofs = passwd_ofs + pw.passwd.len() + 1;
    let dir_ofs = gecos_ofs + pw.gecos.len() + 1;
    let shell_ofs = dir_ofs + pw.dir.len() + 1;

    let mut out = vec![0u8; PW_HDRSZ];
    put_u16(&mut out, PW_PASSWD, u16_of(passwd_ofs, "passwd entry too long")?);
    put_u16(&mut out, PW_GECOS, u16_of(gecos_ofs, "passwd entry too long")?);
    put_u16(&mut out, PW_DIR, u16_of(dir_ofs, "passwd entry too long")?);
    put_u16(&mut out, PW_SHELL, u16_of(shell_ofs, "passwd entry too long")?);
    put_u32(&mut out, PW_UID, pw.uid);
    put_u32(&mut out, PW_GID, pw.gid);
    push_cstr(&mut out, pw.name)?;
    push_cstr(&mut out, pw.passwd)?;
    push_cstr(&mut out, pw.gecos)?;
    push_cstr(&mut out, pw.dir)?;
    push_cstr(&mut out, pw.shell)?;
    Ok(out)
}

/// Insert one passwd entry under its name, the enumeration sentinel, and
/// its uid.
pub fn add_passwd(maker: &mut Maker, pw: &Passwd) -> Result<()> {
    let value = passwd_value(pw)?;
    maker.add(TAG_CANONICAL, pw.name.as_bytes(), &value)?;
    maker.add(TAG_ALIAS, b"", &value)?;
    maker.add(TAG_HEX, &hex8_key(pw.uid), &value)?;
    Ok(())
}

pub fn decode_passwd<'b>(value: &[u8], buf: &'b mut [u8]) -> Result<Passwd<'b>> {
    if value.len() < PW_HDRSZ {
        return Err(NssError::Unavailable);
    }
    let passwd_ofs = usize::from(get_u16(value, PW_PASSWD)?);
    let gecos_ofs = usize::from(get_u16(value, PW_GECOS)?);
    let dir_ofs = usize::from(get_u16(value, PW_DIR)?);
    let shell_ofs = usize::from(get_u16(value, PW_SHELL)?);
    let uid = get_u32(value, PW_UID)?;
    let gid = get_u32(value, PW_GID)?;
    let region = fill(buf, &value[PW_HDRSZ..])?;
    Ok(Passwd {
        name: cstr(region, 0)?,
        passwd: cstr(region, passwd_ofs)?,
        uid,
        gid,
        gecos: cstr(region, gecos_ofs)?,
        dir: cstr(region, dir_ofs)?,
        shell: cstr(region, shell_ofs)?,
    })
}

pub fn passwd_by_name<'b>(db: &NssDb, name: &str, buf: &'b mut [u8]) -> Result<Passwd<'b>> {
    db.lookup(TAG_CANONICAL, name.as_bytes(), buf, |_, _, v, buf| {
        decode_passwd(v, buf)
    })
}

pub fn passwd_by_uid<'b>(db: &NssDb, uid: u32, buf: &'b mut [u8]) -> Result<Passwd<'b>> {
    db.lookup(TAG_HEX, &hex8_key(uid), buf, |_, _, v, buf| {
        decode_passwd(v, buf)
    })
}

pub fn next_passwd<'b>(entries: &mut Entries, buf: &'b mut [u8]) -> Result<Option<Passwd<'b>>> {
    entries.next_with(buf, |v, buf| decode_passwd(v, buf))
}

// group

fn group_value(gr: &Group) -> Result<Vec<u8>> {
    let passwd_ofs = gr.name.len() + 1;
    let mem_str_ofs = passwd_ofs + gr.passwd.len() + 1;

    let mut out = vec![0u8; GR_HDRSZ];
    push_cstr(&mut out, gr.name)?;
    push_cstr(&mut out, gr.passwd)?;
    let count = push_list(&mut out, &gr.members)?;
    let total = out.len() - GR_HDRSZ;

    put_u16(&mut out, GR_PASSWD, u16_of(passwd_ofs, "group entry too long")?);
    put_u16(&mut out, GR_MEM_STR, u16_of(mem_str_ofs, "group entry too long")?);
    put_u16(&mut out, GR_MEM, u16_of(total, "group entry too long")?);
    put_u16(&mut out, GR_MEM_NUM, count);
    put_u32(&mut out, GR_GID, gr.gid);
    Ok(out)
}

/// Insert one group entry under its name, the enumeration sentinel, and
/// its gid.
pub fn add_group(maker: &mut Maker, gr: &Group) -> Result<()> {
    let value = group_value(gr)?;
    maker.add(TAG_CANONICAL, gr.name.as_bytes(), &value)?;
    maker.add(TAG_ALIAS, b"", &value)?;
    maker.add(TAG_HEX, &hex8_key(gr.gid), &value)?;
    Ok(())
}

pub fn decode_group<'b>(value: &[u8], buf: &'b mut [u8]) -> Result<Group<'b>> {
    if value.len() < GR_HDRSZ {
        return Err(NssError::Unavailable);
    }
    let passwd_ofs = usize::from(get_u16(value, GR_PASSWD)?);
    let mem_str_ofs = usize::from(get_u16(value, GR_MEM_STR)?);
    let total = usize::from(get_u16(value, GR_MEM)?);
    let count = usize::from(get_u16(value, GR_MEM_NUM)?);
    let gid = get_u32(value, GR_GID)?;
    let region = fill(buf, &value[GR_HDRSZ..])?;
    let members = region
        .get(mem_str_ofs..total)
        .ok_or(NssError::Unavailable)?;
    Ok(Group {
        name: cstr(region, 0)?,
        passwd: cstr(region, passwd_ofs)?,
        gid,
        members: Members::packed(str_region(members)?, count),
    })
}

pub fn group_by_name<'b>(db: &NssDb, name: &str, buf: &'b mut [u8]) -> Result<Group<'b>> {
    db.lookup(TAG_CANONICAL, name.as_bytes(), buf, |_, _, v, buf| {
        decode_group(v, buf)
    })
}

pub fn group_by_gid<'b>(db: &NssDb, gid: u32, buf: &'b mut [u8]) -> Result<Group<'b>> {
    db.lookup(TAG_HEX, &hex8_key(gid), buf, |_, _, v, buf| {
        decode_group(v, buf)
    })
}

pub fn next_group<'b>(entries: &mut Entries, buf: &'b mut [u8]) -> Result<Option<Group<'b>>> {
    entries.next_with(buf, |v, buf| decode_group(v, buf))
}

// per-user membership (grouplist)

/// Accumulates per-user gid lists while groups stream through `add_group`,
/// then writes one record per user into the same database, keyed by the
/// user name under the alias tag. Lists keep first-seen order.
pub struct GroupMembership {
    order: Vec<String>,
    gids: HashMap<String, Vec<u32>>,
}

impl GroupMembership {
    pub fn new() -> GroupMembership {
        GroupMembership {
            order: Vec::new(),
            gids: HashMap::new(),
        }
    }

    pub fn observe(&mut self, gr: &Group) {
        for member in gr.members.iter() {
            if !self.gids.contains_key(member) {
                self.order.push(member.to_string());
                self.gids.insert(member.to_string(), Vec::new());
            }
            if let Some(gids) = self.gids.get_mut(member) {
                if !gids.contains(&gr.gid) {
                    gids.push(gr.gid);
                }
            }
        }
    }

    pub fn write(&self, maker: &mut Maker) -> Result<()> {
        for user in &self.order {
            let gids = &self.gids[user];
            let mut value = vec![0u8; GL_HDRSZ];
            put_u32(&mut value, GL_NGROUPS, gids.len() as u32);
            for &gid in gids {
                let mut be = [0u8; 4];
                put_u32(&mut be, 0, gid);
                value.extend_from_slice(&be);
            }
            maker.add(TAG_ALIAS, user.as_bytes(), &value)?;
        }
        Ok(())
    }
}

impl Default for GroupMembership {
    fn default() -> GroupMembership {
        GroupMembership::new()
    }
}

/// Gid list decoded out of a grouplist record.
#[derive(Clone, Copy, Debug)]
pub struct Gids<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for Gids<'a> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.data.len() < 4 {
            return None;
        }
        let (head, rest) = self.data.split_at(4);
        self.data = rest;
        Some(mcdb::utils::serialize::read_size(head))
    }
}

pub fn grouplist_by_user<'b>(db: &NssDb, user: &str, buf: &'b mut [u8]) -> Result<Gids<'b>> {
    db.lookup(TAG_ALIAS, user.as_bytes(), buf, |_, _, v, buf| {
        if v.len() < GL_HDRSZ {
            return Err(NssError::Unavailable);
        }
        let n = get_u32(v, GL_NGROUPS)? as usize;
        let data = &v[GL_HDRSZ..];
        if data.len() != n * 4 {
            return Err(NssError::Unavailable);
        }
        Ok(Gids {
            data: fill(buf, data)?,
        })
    })
}

// shadow

fn shadow_field(n: i64, what: &'static str) -> Result<u32> {
    if n == -1 {
        Ok(u32::max_value())
    } else if n >= 0 && n < i64::from(u32::max_value()) {
        Ok(n as u32)
    } else {
        Err(NssError::InvalidInput(what))
    }
}

fn shadow_num(raw: u32) -> i64 {
    if raw == u32::max_value() {
        -1
    } else {
        i64::from(raw)
    }
}

fn shadow_value(sp: &Shadow) -> Result<Vec<u8>> {
    let pwdp_ofs = sp.name.len() + 1;

    let mut out = vec![0u8; SP_HDRSZ];
    put_u32(&mut out, SP_LSTCHG, shadow_field(sp.lastchange, "shadow lastchange")?);
    put_u32(&mut out, SP_MIN, shadow_field(sp.min, "shadow min")?);
    put_u32(&mut out, SP_MAX, shadow_field(sp.max, "shadow max")?);
    put_u32(&mut out, SP_WARN, shadow_field(sp.warn, "shadow warn")?);
    put_u32(&mut out, SP_INACT, shadow_field(sp.inactive, "shadow inactive")?);
    put_u32(&mut out, SP_EXPIRE, shadow_field(sp.expire, "shadow expire")?);
    put_u32(&mut out, SP_FLAG, shadow_field(sp.flag, "shadow flag")?);
    put_u16(&mut out, SP_PWDP, u16_of(pwdp_ofs, "shadow entry too long")?);
    push_cstr(&mut out, sp.name)?;
    push_cstr(&mut out, sp.passwd)?;
    Ok(out)
}

/// Insert one shadow entry under its name and the enumeration sentinel.
pub fn add_shadow(maker: &mut Maker, sp: &Shadow) -> Result<()> {
    let value = shadow_value(sp)?;
    maker.add(TAG_CANONICAL, sp.name.as_bytes(), &value)?;
    maker.add(TAG_ALIAS, b"", &value)?;
    Ok(())
}

pub fn decode_shadow<'b>(value: &[u8], buf: &'b mut [u8]) -> Result<Shadow<'b>> {
    if value.len() < SP_HDRSZ {
        return Err(NssError::Unavailable);
    }
    let pwdp_ofs = usize::from(get_u16(value, SP_PWDP)?);
    let region = fill(buf, &value[SP_HDRSZ..])?;
    Ok(Shadow {
        name: cstr(region, 0)?,
        passwd: cstr(region, pwdp_ofs)?,
        lastchange: shadow_num(get_u32(value, SP_LSTCHG)?),
        min: shadow_num(get_u32(value, SP_MIN)?),
        max: shadow_num(get_u32(value, SP_MAX)?),
        warn: shadow_num(get_u32(value, SP_WARN)?),
        inactive: shadow_num(get_u32(value, SP_INACT)?),
        expire: shadow_num(get_u32(value, SP_EXPIRE)?),
        flag: shadow_num(get_u32(value, SP_FLAG)?),
    })
}

pub fn shadow_by_name<'b>(db: &NssDb, name: &str, buf: &'b mut [u8]) -> Result<Shadow<'b>> {
    db.lookup(TAG_CANONICAL, name.as_bytes(), buf, |_, _, v, buf| {
        decode_shadow(v, buf)
    })
}

pub fn next_shadow<'b>(entries: &mut Entries, buf: &'b mut [u8]) -> Result<Option<Shadow<'b>>> {
    entries.next_with(buf, |v, buf| decode_shadow(v, buf))
}
