// Pacmesh - Cooperative LAN package cache daemon, redirecting misses to clustermates found over multicast
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::convert::TryFrom;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use nom::bytes::complete::{tag, take_while};
use nom::combinator::map_res;
use nom::number::complete::le_u8;
use nom::sequence::{terminated, tuple};
use nom::IResult;

use crate::error::PacmeshError;

pub const PROTOCOL_VERSION: u8 = 1;

/// Message variants understood by every clustermate.
///
/// Field is repr as u8 in networking.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Variant {
    /// Sender is looking for a package file with the given name.
    Search = 0,

    /// Sender has the package file with the given name.
    Found = 1,

    /// Sender does NOT have the package file with the given name.
    NotFound = 2,

    /// Sender is looking for other clustermates.
    Ping = 3,

    /// Sender is announcing presence in the cluster.
    Pong = 4,

    /// Sender is about to shut down and leave the cluster.
    Gone = 5,
}

/// A single group datagram.
///
/// `pkg` is mandatory for the package-bearing variants and meaningless for
/// the liveness ones. `dest` is an informational hint of the address the
/// sender targeted; receivers identify a peer by the datagram source
/// address, never by `dest`.
#[derive(Debug, PartialEq)]
pub struct Message<'n> {
    pub variant: Variant,

    /// Package file name, when the variant carries one.
    pub pkg: Option<&'n str>,

    /// Address the sender aimed the datagram at.
    pub dest: Option<&'n str>,
}

impl Variant {
    fn requires_pkg(&self) -> bool {
        matches!(self, Variant::Search | Variant::Found | Variant::NotFound)
    }
}

impl TryFrom<u8> for Variant {
    type Error = PacmeshError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            x if x == Variant::Search as u8 => Ok(Variant::Search),
            x if x == Variant::Found as u8 => Ok(Variant::Found),
            x if x == Variant::NotFound as u8 => Ok(Variant::NotFound),
            x if x == Variant::Ping as u8 => Ok(Variant::Ping),
            x if x == Variant::Pong as u8 => Ok(Variant::Pong),
            x if x == Variant::Gone as u8 => Ok(Variant::Gone),
            x => Err(PacmeshError::InvalidMessageVariant(x)),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl<'n> Message<'n> {
    pub fn search(pkg: &'n str, dest: &'n str) -> Self {
        Self {
            variant: Variant::Search,
            pkg: Some(pkg),
            dest: Some(dest),
        }
    }

    pub fn found(pkg: &'n str, dest: &'n str) -> Self {
        Self {
            variant: Variant::Found,
            pkg: Some(pkg),
            dest: Some(dest),
        }
    }

    pub fn notfound(pkg: &'n str, dest: &'n str) -> Self {
        Self {
            variant: Variant::NotFound,
            pkg: Some(pkg),
            dest: Some(dest),
        }
    }

    pub fn ping(dest: &'n str) -> Self {
        Self {
            variant: Variant::Ping,
            pkg: None,
            dest: Some(dest),
        }
    }

    pub fn pong(dest: &'n str) -> Self {
        Self {
            variant: Variant::Pong,
            pkg: None,
            dest: Some(dest),
        }
    }

    pub fn gone(dest: &'n str) -> Self {
        Self {
            variant: Variant::Gone,
            pkg: None,
            dest: Some(dest),
        }
    }

    pub fn parse(input: &'n [u8]) -> IResult<&'n [u8], Message<'n>> {
        map_res(
            tuple((
                map_res(le_u8, protocol_version),
                map_res(le_u8, Variant::try_from),
                parse_cstring,
                parse_cstring,
            )),
            |(_, variant, pkg, dest)| {
                let pkg = if pkg.is_empty() { None } else { Some(pkg) };
                let dest = if dest.is_empty() { None } else { Some(dest) };

                if variant.requires_pkg() && pkg.is_none() {
                    return Err(PacmeshError::MalformedPayload);
                }

                Ok(Message { variant, pkg, dest })
            },
        )(input)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.variant.clone() as u8);
        buf.put_slice(self.pkg.unwrap_or("").as_bytes());
        buf.put_u8(0);
        buf.put_slice(self.dest.unwrap_or("").as_bytes());
        buf.put_u8(0);

        buf.freeze()
    }
}

fn protocol_version(value: u8) -> Result<u8, PacmeshError> {
    if value != PROTOCOL_VERSION {
        return Err(PacmeshError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            received: value,
        });
    }

    Ok(value)
}

fn parse_cstring(input: &[u8]) -> IResult<&[u8], &str> {
    map_res(
        terminated(take_while(|b| b != 0), tag([0])),
        std::str::from_utf8,
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[rustfmt::skip]
    fn parse_valid_ping() {
        let payload: &[u8] = &[
            PROTOCOL_VERSION, 0x03,
            0x00, // no pkg
            0x00, // no dest
        ];

        let m = Message::parse(payload).unwrap().1;

        assert_eq!(
            m,
            Message {
                variant: Variant::Ping,
                pkg: None,
                dest: None,
            }
        );
    }

    #[test]
    #[rustfmt::skip]
    fn parse_valid_search() {
        let payload: &[u8] = &[
            PROTOCOL_VERSION, 0x00,
            0x66, 0x6f, 0x6f, 0x00, // foo
            0x00, // no dest
        ];

        let m = Message::parse(payload).unwrap().1;

        assert_eq!(m.variant, Variant::Search);
        assert_eq!(m.pkg, Some("foo"));
        assert_eq!(m.dest, None);
    }

    #[test]
    #[rustfmt::skip]
    fn parse_invalid_version() {
        let payload: &[u8] = &[
            0x64, 0x03,
            0x00,
            0x00,
        ];

        assert_ne!(payload[0], PROTOCOL_VERSION);

        assert!(Message::parse(payload).is_err());
    }

    #[test]
    #[rustfmt::skip]
    fn parse_invalid_variant() {
        let payload: &[u8] = &[
            PROTOCOL_VERSION, 0x64,
            0x00,
            0x00,
        ];

        assert!(Message::parse(payload).is_err());
    }

    #[test]
    #[rustfmt::skip]
    fn parse_search_without_pkg() {
        let payload: &[u8] = &[
            PROTOCOL_VERSION, 0x00,
            0x00,
            0x00,
        ];

        assert!(Message::parse(payload).is_err());
    }

    #[test]
    #[rustfmt::skip]
    fn parse_truncated() {
        let payload: &[u8] = &[
            PROTOCOL_VERSION, 0x01,
            0x62, 0x61, 0x72, // bar, unterminated
        ];

        assert!(Message::parse(payload).is_err());
    }

    #[test]
    fn roundtrip_found() {
        let m = Message::found("bar-2-1-x86_64.pkg.tar.xz", "239.0.0.156");

        let raw = m.to_bytes();

        assert_eq!(Message::parse(&raw).unwrap().1, m);
    }

    #[test]
    fn roundtrip_gone() {
        let m = Message::gone("239.0.0.156");

        let raw = m.to_bytes();

        assert_eq!(Message::parse(&raw).unwrap().1, m);
    }
}
