//! DNS wire-format codec: query encoding, response decoding and
//! presentation-format rendering of answer records.

use anyhow::{bail, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_MX: u16 = 15;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_CAA: u16 = 257;

const CLASS_IN: u16 = 1;
const MAX_NAME_JUMPS: usize = 32;

#[derive(Debug, Clone)]
pub struct Answer {
    pub name: String,
    pub rtype: u16,
    pub ttl: u32,
    pub rdata: String,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub id: u16,
    pub rcode: u8,
    pub answers: Vec<Answer>,
}

/// Encode a recursion-desired query for a single question. The domain is
/// expected in absolute form (trailing dot).
pub fn encode_query(id: u16, domain: &str, qtype: u16) -> Result<Vec<u8>> {
    let mut msg = Vec::with_capacity(17 + domain.len());
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    msg.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    msg.extend_from_slice(&[0; 6]); // AN/NS/AR counts
    encode_name(&mut msg, domain)?;
    msg.extend_from_slice(&qtype.to_be_bytes());
    msg.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(msg)
}

fn encode_name(out: &mut Vec<u8>, domain: &str) -> Result<()> {
    for label in domain.split('.') {
        if label.is_empty() {
            continue;
        }
        if label.len() > 63 {
            bail!("label too long: {}", label);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

/// Decode a response message, rendering each answer's rdata into
/// presentation format.
pub fn decode_response(buf: &[u8]) -> Result<Response> {
    if buf.len() < 12 {
        bail!("dns message shorter than header");
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    if flags & 0x8000 == 0 {
        bail!("not a response message");
    }
    let rcode = (flags & 0x000f) as u8;
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    let ancount = u16::from_be_bytes([buf[6], buf[7]]);

    let mut pos = 12usize;
    for _ in 0..qdcount {
        let (_, next) = decode_name(buf, pos)?;
        pos = next + 4; // qtype + qclass
    }

    let mut answers = Vec::new();
    for _ in 0..ancount {
        let (name, next) = decode_name(buf, pos)?;
        pos = next;
        if pos + 10 > buf.len() {
            bail!("truncated answer record");
        }
        let rtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let ttl = u32::from_be_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]);
        let rdlen = u16::from_be_bytes([buf[pos + 8], buf[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlen > buf.len() {
            bail!("truncated rdata");
        }
        let rdata = render_rdata(buf, pos, rdlen, rtype)?;
        pos += rdlen;
        answers.push(Answer {
            name,
            rtype,
            ttl,
            rdata,
        });
    }

    Ok(Response { id, rcode, answers })
}

/// Read a possibly-compressed name starting at `pos`. Returns the name and
/// the position just past it in the uncompressed stream.
fn decode_name(buf: &[u8], mut pos: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut jumps = 0usize;
    let mut end: Option<usize> = None;

    loop {
        if pos >= buf.len() {
            bail!("name runs past message");
        }
        let len = buf[pos];
        if len & 0xc0 == 0xc0 {
            if pos + 1 >= buf.len() {
                bail!("truncated compression pointer");
            }
            let target = ((len as usize & 0x3f) << 8) | buf[pos + 1] as usize;
            if end.is_none() {
                end = Some(pos + 2);
            }
            jumps += 1;
            if jumps > MAX_NAME_JUMPS {
                bail!("compression pointer loop");
            }
            pos = target;
            continue;
        }
        if len == 0 {
            pos += 1;
            break;
        }
        let len = len as usize;
        if pos + 1 + len > buf.len() {
            bail!("label runs past message");
        }
        name.push_str(&String::from_utf8_lossy(&buf[pos + 1..pos + 1 + len]));
        name.push('.');
        pos += 1 + len;
    }

    if name.is_empty() {
        name.push('.');
    }
    Ok((name, end.unwrap_or(pos)))
}

fn render_rdata(buf: &[u8], pos: usize, rdlen: usize, rtype: u16) -> Result<String> {
    let rdata = &buf[pos..pos + rdlen];
    let rendered = match rtype {
        TYPE_A if rdlen == 4 => {
            Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string()
        }
        TYPE_AAAA if rdlen == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            Ipv6Addr::from(octets).to_string()
        }
        TYPE_NS | TYPE_CNAME | TYPE_PTR => decode_name(buf, pos)?.0,
        TYPE_MX => {
            if rdlen < 3 {
                bail!("short MX rdata");
            }
            let pref = u16::from_be_bytes([rdata[0], rdata[1]]);
            let (exchange, _) = decode_name(buf, pos + 2)?;
            format!("{} {}", pref, exchange)
        }
        TYPE_TXT => {
            let mut parts = Vec::new();
            let mut i = 0usize;
            while i < rdata.len() {
                let len = rdata[i] as usize;
                if i + 1 + len > rdata.len() {
                    break;
                }
                parts.push(format!(
                    "\"{}\"",
                    String::from_utf8_lossy(&rdata[i + 1..i + 1 + len])
                ));
                i += 1 + len;
            }
            parts.join(" ")
        }
        TYPE_SRV => {
            if rdlen < 7 {
                bail!("short SRV rdata");
            }
            let prio = u16::from_be_bytes([rdata[0], rdata[1]]);
            let weight = u16::from_be_bytes([rdata[2], rdata[3]]);
            let port = u16::from_be_bytes([rdata[4], rdata[5]]);
            let (target, _) = decode_name(buf, pos + 6)?;
            format!("{} {} {} {}", prio, weight, port, target)
        }
        TYPE_CAA => {
            if rdlen < 2 {
                bail!("short CAA rdata");
            }
            let flags = rdata[0];
            let tag_len = rdata[1] as usize;
            if 2 + tag_len > rdata.len() {
                bail!("short CAA tag");
            }
            let tag = String::from_utf8_lossy(&rdata[2..2 + tag_len]);
            let value = String::from_utf8_lossy(&rdata[2 + tag_len..]);
            format!("{} {} \"{}\"", flags, tag, value)
        }
        _ => rdata.iter().map(|b| format!("{:02x}", b)).collect(),
    };
    Ok(rendered)
}

/// Render an answer the way dig presents it, single spaces throughout.
pub fn answer_to_string(a: &Answer) -> String {
    normalize_tabs(&format!(
        "{} {} IN {} {}",
        a.name,
        a.ttl,
        qtype_name(a.rtype),
        a.rdata
    ))
}

pub fn normalize_tabs(s: &str) -> String {
    s.replace('\t', " ")
}

pub fn qtype_name(rtype: u16) -> String {
    match rtype {
        TYPE_A => "A".to_string(),
        TYPE_NS => "NS".to_string(),
        TYPE_CNAME => "CNAME".to_string(),
        TYPE_PTR => "PTR".to_string(),
        TYPE_MX => "MX".to_string(),
        TYPE_TXT => "TXT".to_string(),
        TYPE_AAAA => "AAAA".to_string(),
        TYPE_SRV => "SRV".to_string(),
        TYPE_CAA => "CAA".to_string(),
        other => format!("TYPE{}", other),
    }
}

pub fn rcode_name(rcode: u8) -> String {
    match rcode {
        0 => "NOERROR".to_string(),
        1 => "FORMERR".to_string(),
        2 => "SERVFAIL".to_string(),
        3 => "NXDOMAIN".to_string(),
        4 => "NOTIMP".to_string(),
        5 => "REFUSED".to_string(),
        other => format!("RCODE{}", other),
    }
}

/// Reverse-lookup form of an IP address: in-addr.arpa for IPv4, nibble
/// ip6.arpa for IPv6.
pub fn reverse_addr(ip: &str) -> Result<String> {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let o = v4.octets();
            Ok(format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0]))
        }
        Ok(IpAddr::V6(v6)) => {
            let mut nibbles = Vec::with_capacity(32);
            for byte in v6.octets().iter().rev() {
                nibbles.push(format!("{:x}", byte & 0x0f));
                nibbles.push(format!("{:x}", byte >> 4));
            }
            Ok(format!("{}.ip6.arpa.", nibbles.join(".")))
        }
        Err(_) => bail!("invalid IP for reverse lookup: {}", ip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_query() {
        let msg = encode_query(0xbeef, "example.com.", TYPE_A).unwrap();
        assert_eq!(&msg[0..2], &[0xbe, 0xef]);
        assert_eq!(&msg[2..4], &[0x01, 0x00]);
        // 7"example" 3"com" 0
        let name_start = 12;
        assert_eq!(msg[name_start], 7);
        assert_eq!(&msg[name_start + 1..name_start + 8], b"example");
        assert_eq!(msg[name_start + 8], 3);
        assert_eq!(msg[msg.len() - 4..], [0, 1, 0, 1]);
    }

    fn response_with_answer(qname: &[u8], rtype: u16, rdata: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&0x1234u16.to_be_bytes());
        msg.extend_from_slice(&0x8180u16.to_be_bytes()); // QR, RD, RA
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&[0; 4]);
        msg.extend_from_slice(qname);
        msg.extend_from_slice(&rtype.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        // Answer name: pointer to offset 12.
        msg.extend_from_slice(&[0xc0, 0x0c]);
        msg.extend_from_slice(&rtype.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&300u32.to_be_bytes());
        msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        msg.extend_from_slice(rdata);
        msg
    }

    #[test]
    fn test_decode_a_record_with_compression() {
        let qname = b"\x07example\x03com\x00";
        let msg = response_with_answer(qname, TYPE_A, &[93, 184, 216, 34]);
        let resp = decode_response(&msg).unwrap();
        assert_eq!(resp.id, 0x1234);
        assert_eq!(resp.rcode, 0);
        assert_eq!(resp.answers.len(), 1);
        let a = &resp.answers[0];
        assert_eq!(a.name, "example.com.");
        assert_eq!(a.rdata, "93.184.216.34");
        assert_eq!(
            answer_to_string(a),
            "example.com. 300 IN A 93.184.216.34"
        );
    }

    #[test]
    fn test_decode_ptr_record() {
        // PTR rdata is itself a name: dns.google.
        let qname = b"\x018\x018\x018\x018\x07in-addr\x04arpa\x00";
        let rdata = b"\x03dns\x06google\x00";
        let msg = response_with_answer(qname, TYPE_PTR, rdata);
        let resp = decode_response(&msg).unwrap();
        assert_eq!(resp.answers[0].rdata, "dns.google.");
        assert!(answer_to_string(&resp.answers[0]).contains("dns.google"));
    }

    #[test]
    fn test_decode_rejects_pointer_loop() {
        let mut msg = Vec::new();
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&0x8000u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&[0; 6]);
        // Question name is a pointer to itself.
        msg.extend_from_slice(&[0xc0, 0x0c]);
        msg.extend_from_slice(&[0, 1, 0, 1]);
        assert!(decode_response(&msg).is_err());
    }

    #[test]
    fn test_reverse_addr_v4() {
        assert_eq!(reverse_addr("8.8.8.8").unwrap(), "8.8.8.8.in-addr.arpa.");
        assert_eq!(
            reverse_addr("192.0.2.1").unwrap(),
            "1.2.0.192.in-addr.arpa."
        );
    }

    #[test]
    fn test_reverse_addr_v6() {
        assert_eq!(
            reverse_addr("::1").unwrap(),
            "1.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.ip6.arpa."
        );
    }

    #[test]
    fn test_reverse_addr_rejects_names() {
        assert!(reverse_addr("google.com").is_err());
    }

    #[test]
    fn test_rcode_name() {
        assert_eq!(rcode_name(0), "NOERROR");
        assert_eq!(rcode_name(3), "NXDOMAIN");
        assert_eq!(rcode_name(11), "RCODE11");
    }

    #[test]
    fn test_normalize_tabs() {
        assert_eq!(normalize_tabs("a\tb\tc"), "a b c");
    }

    #[test]
    fn test_txt_rendering() {
        let qname = b"\x07example\x03com\x00";
        let rdata = b"\x05hello\x05world";
        let msg = response_with_answer(qname, TYPE_TXT, rdata);
        let resp = decode_response(&msg).unwrap();
        assert_eq!(resp.answers[0].rdata, "\"hello\" \"world\"");
    }

    #[test]
    fn test_mx_rendering() {
        let qname = b"\x07example\x03com\x00";
        let mut rdata = Vec::new();
        rdata.extend_from_slice(&10u16.to_be_bytes());
        rdata.extend_from_slice(b"\x04mail\x07example\x03com\x00");
        let msg = response_with_answer(qname, TYPE_MX, &rdata);
        let resp = decode_response(&msg).unwrap();
        assert_eq!(resp.answers[0].rdata, "10 mail.example.com.");
    }
}
