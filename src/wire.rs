use std::fmt::Write as _;
use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const HEADER_LEN: usize = 12;
pub const CLASS_IN: u16 = 1;

const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;

/// QR=1, RD=1, RA=1, RCODE=NOERROR
const RESPONSE_FLAGS: u16 = 0x8180;

/// 需要在 RDATA 内展开压缩域名的记录类型
pub mod rtype {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const SOA: u16 = 6;
    pub const PTR: u16 = 12;
    pub const MX: u16 = 15;
    pub const AAAA: u16 = 28;
    pub const SRV: u16 = 33;
    pub const DNAME: u16 = 39;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("packet shorter than dns header ({0} bytes)")]
    ShortHeader(usize),
    #[error("unexpected end of packet at offset {0}")]
    Truncated(usize),
    #[error("label at offset {0} runs past end of packet")]
    LabelOverrun(usize),
    #[error("unsupported label type {0:#04x} at offset {1}")]
    BadLabel(u8, usize),
    #[error("compression pointer at offset {from} does not point backwards (target {to})")]
    BadPointer { from: usize, to: usize },
    #[error("domain name exceeds 255 bytes")]
    NameTooLong,
    #[error("label of {0} bytes exceeds 63")]
    LabelTooLong(usize),
    #[error("bad escape sequence in name `{0}`")]
    BadEscape(String),
    #[error("name in rdata at offset {0} runs past rdlength")]
    RdataOverrun(usize),
    #[error("rdata of {0} bytes does not fit a record")]
    RdataTooLong(usize),
    #[error("packet carries no question")]
    NoQuestion,
    #[error("too many answers to encode: {0}")]
    TooManyAnswers(usize),
}

/// Header flag word: QR(1) Opcode(4) AA(1) TC(1) RD(1) RA(1) Z(3) RCODE(4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(pub u16);

impl Flags {
    pub fn is_response(self) -> bool {
        self.0 & 0x8000 != 0
    }

    pub fn opcode(self) -> u8 {
        ((self.0 >> 11) & 0x0F) as u8
    }

    pub fn recursion_desired(self) -> bool {
        self.0 & 0x0100 != 0
    }

    pub fn rcode(self) -> u8 {
        (self.0 & 0x000F) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: Flags,
    pub qd_count: u16,
    pub an_count: u16,
    pub ns_count: u16,
    pub ar_count: u16,
}

impl Header {
    pub fn parse(packet: &[u8]) -> Result<Self, WireError> {
        if packet.len() < HEADER_LEN {
            return Err(WireError::ShortHeader(packet.len()));
        }
        Ok(Self {
            id: be_u16(packet, 0),
            flags: Flags(be_u16(packet, 2)),
            qd_count: be_u16(packet, 4),
            an_count: be_u16(packet, 6),
            ns_count: be_u16(packet, 8),
            ar_count: be_u16(packet, 10),
        })
    }

    fn write(&self, out: &mut impl BufMut) {
        out.put_u16(self.id);
        out.put_u16(self.flags.0);
        out.put_u16(self.qd_count);
        out.put_u16(self.an_count);
        out.put_u16(self.ns_count);
        out.put_u16(self.ar_count);
    }
}

/// 解码后的查询：头部 + 第一个 Question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub header: Header,
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    #[inline]
    pub fn id(&self) -> u16 {
        self.header.id
    }
}

/// One answer record. RDATA stays opaque except that embedded domain names are
/// stored uncompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: Vec<u8>,
}

/// 解析查询包的头部和第一个 Question，其余段忽略
pub fn decode_query(packet: &[u8]) -> Result<DnsQuery, WireError> {
    let header = Header::parse(packet)?;
    if header.qd_count == 0 {
        return Err(WireError::NoQuestion);
    }
    let (name, pos) = read_name(packet, HEADER_LEN)?;
    let fixed = packet.get(pos..pos + 4).ok_or(WireError::Truncated(pos))?;
    Ok(DnsQuery {
        header,
        name,
        qtype: be_u16(fixed, 0),
        qclass: be_u16(fixed, 2),
    })
}

/// Every answer record of an upstream response. An unparseable response yields
/// no records at all; a response without answers is not an error.
pub fn extract_records(packet: &[u8]) -> Vec<ResourceRecord> {
    parse_answers(packet).unwrap_or_default()
}

/// Like [`extract_records`], but reports why parsing stopped.
pub fn parse_answers(packet: &[u8]) -> Result<Vec<ResourceRecord>, WireError> {
    let header = Header::parse(packet)?;
    if header.an_count == 0 {
        return Ok(Vec::new());
    }

    let mut pos = HEADER_LEN;
    for _ in 0..header.qd_count {
        pos = skip_name(packet, pos)? + 4;
    }

    let mut records = Vec::with_capacity(header.an_count as usize);
    for _ in 0..header.an_count {
        let (name, next) = read_name(packet, pos)?;
        // Type(2) Class(2) TTL(4) RDLen(2)
        let fixed = packet.get(next..next + 10).ok_or(WireError::Truncated(next))?;
        let rtype = be_u16(fixed, 0);
        let class = be_u16(fixed, 2);
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rd_len = be_u16(fixed, 8) as usize;

        let start = next + 10;
        let rdata = start..start + rd_len;
        if rdata.end > packet.len() {
            return Err(WireError::Truncated(packet.len()));
        }
        let data = expand_rdata(packet, rtype, rdata)?;
        records.push(ResourceRecord {
            name,
            rtype,
            class,
            ttl,
            data,
        });
        pos = start + rd_len;
    }
    Ok(records)
}

/// 用缓存记录合成应答：复用事务 ID，原样拷贝查询中的 Question 段
pub fn build_response<'a, I>(id: u16, query: &[u8], records: I) -> Result<Bytes, WireError>
where
    I: IntoIterator<Item = &'a ResourceRecord>,
    I::IntoIter: ExactSizeIterator,
{
    let question = question_section(query)?;
    let records = records.into_iter();
    let an_count =
        u16::try_from(records.len()).map_err(|_| WireError::TooManyAnswers(records.len()))?;

    let mut out = BytesMut::with_capacity(512);
    Header {
        id,
        flags: Flags(RESPONSE_FLAGS),
        qd_count: 1,
        an_count,
        ns_count: 0,
        ar_count: 0,
    }
    .write(&mut out);
    out.put_slice(question);

    for rr in records {
        let rd_len =
            u16::try_from(rr.data.len()).map_err(|_| WireError::RdataTooLong(rr.data.len()))?;
        encode_name(&rr.name, &mut out)?;
        out.put_u16(rr.rtype);
        out.put_u16(rr.class);
        out.put_u32(rr.ttl);
        out.put_u16(rd_len);
        out.put_slice(&rr.data);
    }
    Ok(out.freeze())
}

/// The first question section of `query`, byte for byte.
pub fn question_section(query: &[u8]) -> Result<&[u8], WireError> {
    Header::parse(query)?;
    let end = skip_name(query, HEADER_LEN)? + 4;
    query.get(HEADER_LEN..end).ok_or(WireError::Truncated(query.len()))
}

/// Dotted presentation name to uncompressed wire labels. Empty labels (root,
/// trailing dot) are skipped; `\.`, `\\` and `\DDD` escapes are undone.
pub fn encode_name(name: &str, out: &mut impl BufMut) -> Result<(), WireError> {
    let mut wire_len = 1;
    let mut label = Vec::with_capacity(MAX_LABEL_LEN);
    let mut bytes = name.bytes();
    loop {
        let next = bytes.next();
        match next {
            None | Some(b'.') => {
                if !label.is_empty() {
                    if label.len() > MAX_LABEL_LEN {
                        return Err(WireError::LabelTooLong(label.len()));
                    }
                    wire_len += label.len() + 1;
                    if wire_len > MAX_NAME_LEN {
                        return Err(WireError::NameTooLong);
                    }
                    out.put_u8(label.len() as u8);
                    out.put_slice(&label);
                    label.clear();
                }
                if next.is_none() {
                    break;
                }
            }
            Some(b'\\') => {
                let byte = unescape(&mut bytes).ok_or_else(|| WireError::BadEscape(name.to_string()))?;
                label.push(byte);
            }
            Some(b) => label.push(b),
        }
    }
    out.put_u8(0);
    Ok(())
}

/// The byte after a backslash: either `DDD` (decimal, at most 255) or one literal byte.
fn unescape(bytes: &mut impl Iterator<Item = u8>) -> Option<u8> {
    let first = bytes.next()?;
    if !first.is_ascii_digit() {
        return Some(first);
    }
    let mut value = u16::from(first - b'0');
    for _ in 0..2 {
        let d = bytes.next().filter(u8::is_ascii_digit)?;
        value = value * 10 + u16::from(d - b'0');
    }
    u8::try_from(value).ok()
}

/// Appends one wire label in presentation form. Bytes outside printable ASCII
/// become `\DDD`; `.` and `\` are backslash-escaped so labels never merge.
fn push_label(name: &mut String, label: &[u8]) {
    for &b in label {
        match b {
            b'.' | b'\\' => {
                name.push('\\');
                name.push(b as char);
            }
            0x21..=0x7e => name.push(b as char),
            _ => {
                let _ = write!(name, "\\{b:03}");
            }
        }
    }
}

fn read_name(packet: &[u8], start: usize) -> Result<(String, usize), WireError> {
    let mut name = String::new();
    let next = walk_name(packet, start, |label| {
        if !name.is_empty() {
            name.push('.');
        }
        push_label(&mut name, label);
    })?;
    Ok((name, next))
}

#[inline]
fn skip_name(packet: &[u8], start: usize) -> Result<usize, WireError> {
    walk_name(packet, start, |_| {})
}

/// Visits each label of the name at `start`, following compression pointers.
/// Returns the offset just past the name as it is stored at `start`.
///
/// Every pointer must target an offset below the previous jump origin, which
/// rules out loops without a jump counter.
fn walk_name(
    packet: &[u8],
    start: usize,
    mut visit: impl FnMut(&[u8]),
) -> Result<usize, WireError> {
    let mut pos = start;
    let mut limit = start;
    let mut resume = None;
    let mut wire_len = 1;

    loop {
        let len = *packet.get(pos).ok_or(WireError::Truncated(pos))?;
        match len & 0xC0 {
            0x00 if len == 0 => {
                return Ok(resume.unwrap_or(pos + 1));
            }
            0x00 => {
                let label_len = len as usize;
                let label = packet
                    .get(pos + 1..pos + 1 + label_len)
                    .ok_or(WireError::LabelOverrun(pos))?;
                wire_len += label_len + 1;
                if wire_len > MAX_NAME_LEN {
                    return Err(WireError::NameTooLong);
                }
                visit(label);
                pos += 1 + label_len;
            }
            0xC0 => {
                let low = *packet.get(pos + 1).ok_or(WireError::Truncated(pos + 1))?;
                let target = (((len & 0x3F) as usize) << 8) | low as usize;
                if target >= limit.min(pos) {
                    return Err(WireError::BadPointer {
                        from: pos,
                        to: target,
                    });
                }
                resume.get_or_insert(pos + 2);
                limit = target;
                pos = target;
            }
            _ => return Err(WireError::BadLabel(len, pos)),
        }
    }
}

/// Copies the name at `start` into `out` in uncompressed wire form.
fn copy_name(packet: &[u8], start: usize, out: &mut Vec<u8>) -> Result<usize, WireError> {
    let next = walk_name(packet, start, |label| {
        out.push(label.len() as u8);
        out.extend_from_slice(label);
    })?;
    out.push(0);
    Ok(next)
}

/// Like [`copy_name`], but the name must end inside `rdata`.
fn copy_rdata_name(
    packet: &[u8],
    start: usize,
    rdata: &Range<usize>,
    out: &mut Vec<u8>,
) -> Result<usize, WireError> {
    if start >= rdata.end {
        return Err(WireError::RdataOverrun(rdata.start));
    }
    let next = copy_name(packet, start, out)?;
    if next > rdata.end {
        return Err(WireError::RdataOverrun(rdata.start));
    }
    Ok(next)
}

fn expand_rdata(packet: &[u8], rtype: u16, rdata: Range<usize>) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(rdata.len());
    match rtype {
        rtype::NS | rtype::CNAME | rtype::PTR | rtype::DNAME => {
            copy_rdata_name(packet, rdata.start, &rdata, &mut out)?;
        }
        rtype::MX => {
            // preference(2) + exchange
            if rdata.len() < 2 {
                return Err(WireError::Truncated(rdata.start));
            }
            out.extend_from_slice(&packet[rdata.start..rdata.start + 2]);
            copy_rdata_name(packet, rdata.start + 2, &rdata, &mut out)?;
        }
        rtype::SRV => {
            // priority(2) weight(2) port(2) + target
            if rdata.len() < 6 {
                return Err(WireError::Truncated(rdata.start));
            }
            out.extend_from_slice(&packet[rdata.start..rdata.start + 6]);
            copy_rdata_name(packet, rdata.start + 6, &rdata, &mut out)?;
        }
        rtype::SOA => {
            // mname rname serial refresh retry expire minimum
            let pos = copy_rdata_name(packet, rdata.start, &rdata, &mut out)?;
            let pos = copy_rdata_name(packet, pos, &rdata, &mut out)?;
            let tail = packet
                .get(pos..pos + 20)
                .filter(|_| pos + 20 <= rdata.end)
                .ok_or(WireError::Truncated(pos))?;
            out.extend_from_slice(tail);
        }
        _ => out.extend_from_slice(&packet[rdata]),
    }
    Ok(out)
}

#[inline]
fn be_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}
