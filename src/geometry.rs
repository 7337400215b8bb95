//! GeoPackage Binary (GPB) envelope handling and EWKB conversion.
//!
//! A GPB blob is a small fixed header (magic, version, flags, SRID, optional
//! envelope) followed by a standard ISO WKB body. See OGC 12-128r18 §2.1.3.
//! This module owns the header codec; the WKB body itself is handed to the
//! `wkb` crate wherever geometry contents actually need to be read.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{RepoError, Result};
use wkb::reader::Wkb;

const GPB_MAGIC: [u8; 2] = [0x47, 0x50]; // b"GP"

/// Parsed fixed header of a GPB blob, without touching the WKB body.
#[derive(Clone, Copy, Debug)]
struct GpbHeader {
    wkb_offset: usize,
    is_le: bool,
    srid: i32,
    empty: bool,
    envelope_indicator: u8,
}

fn parse_header(bytes: &[u8]) -> Result<GpbHeader> {
    if bytes.len() < 8 {
        return Err(RepoError::InvalidGpkgGeometryLength {
            len: bytes.len(),
            minimum: 8,
        });
    }
    if bytes[0..2] != GPB_MAGIC {
        return Err(RepoError::BadGeometry(
            "missing 'GP' magic bytes".to_string(),
        ));
    }
    let version = bytes[2];
    if version != 0 {
        return Err(RepoError::Unsupported(format!(
            "gpkg geometry binary version {version}"
        )));
    }
    let flags = bytes[3];
    if flags & 0x20 != 0 {
        return Err(RepoError::Unsupported(
            "extended gpkg geometry flags".to_string(),
        ));
    }
    let is_le = flags & 0x01 != 0;
    let empty = flags & 0x10 != 0;
    let envelope_indicator = (flags >> 1) & 0x07;
    let envelope_len = match envelope_indicator {
        0 => 0,
        1 => 32,
        2 | 3 => 48,
        4 => 64,
        _ => return Err(RepoError::InvalidGpkgGeometryFlags(flags)),
    };

    let srid = if is_le {
        LittleEndian::read_i32(&bytes[4..8])
    } else {
        BigEndian::read_i32(&bytes[4..8])
    };

    let wkb_offset = 8 + envelope_len;
    if bytes.len() < wkb_offset {
        return Err(RepoError::InvalidGpkgGeometryEnvelope {
            len: bytes.len(),
            required: wkb_offset,
        });
    }

    Ok(GpbHeader {
        wkb_offset,
        is_le,
        srid,
        empty,
        envelope_indicator,
    })
}

/// Split a GPB blob into `(wkb_offset, is_le, srid)`, the three facts callers
/// need to locate and interpret the WKB body without re-validating the
/// envelope payload.
pub fn parse_gpkg_geom(bytes: &[u8]) -> Result<(usize, bool, i32)> {
    let header = parse_header(bytes)?;
    Ok((header.wkb_offset, header.is_le, header.srid))
}

/// Parse a GPB blob into a `wkb::reader::Wkb`, the representation the spatial
/// SQL functions and conversions module walk to compute bounds, type names,
/// and dimensions.
pub fn gpkg_geometry_to_wkb(bytes: &[u8]) -> Result<Wkb<'_>> {
    let header = parse_header(bytes)?;
    let wkb = Wkb::try_new(&bytes[header.wkb_offset..])?;
    Ok(wkb)
}

/// Wrap a parsed WKB geometry back into a GPB blob carrying the given SRID.
///
/// Always emits a minimal header: little-endian, no envelope. Callers that
/// need an envelope for spatial-index purposes should compute one separately
/// and call `ogc_sql::refresh_bounding_box` against `gpkg_contents` instead of
/// relying on the per-row envelope.
pub fn wkb_to_gpkg_geometry<G: geo_traits::GeometryTrait<T = f64>>(
    geometry: G,
    srid: i32,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&GPB_MAGIC);
    out.push(0); // version
    out.push(0x01); // LE, no envelope, not empty
    out.extend_from_slice(&srid.to_le_bytes());
    wkb::writer::write_geometry(&mut out, &geometry, &Default::default())?;
    Ok(out)
}

/// Compute the 2D envelope of a GPB blob.
///
/// Prefers the header's own envelope when present; otherwise walks the WKB
/// body. Returns `None` for an empty geometry.
pub fn geom_envelope(bytes: &[u8]) -> Result<Option<(f64, f64, f64, f64)>> {
    let header = parse_header(bytes)?;
    if header.empty {
        return Ok(None);
    }
    if header.envelope_indicator == 0 {
        let wkb = Wkb::try_new(&bytes[header.wkb_offset..])?;
        return Ok(crate::sql_functions::bounds_from_geometry(&wkb)
            .map(|b| (b.minx, b.maxx, b.miny, b.maxy)));
    }

    let read_f64 = |slot: usize| -> Result<f64> {
        let start = 8 + slot * 8;
        let raw = &bytes[start..start + 8];
        let value = if header.is_le {
            LittleEndian::read_f64(raw)
        } else {
            BigEndian::read_f64(raw)
        };
        if value.is_nan() {
            return Err(RepoError::BadGeometry(
                "NaN coordinate in geometry envelope".to_string(),
            ));
        }
        Ok(value)
    };
    let minx = read_f64(0)?;
    let maxx = read_f64(1)?;
    let miny = read_f64(2)?;
    let maxy = read_f64(3)?;
    Ok(Some((minx, maxx, miny, maxy)))
}

/// Convert a GPB blob's WKB body into Extended WKB (PostGIS-style), folding
/// the GPB header's SRID and the ISO WKB's z/m indicator into the EWKB type
/// word's high bits.
pub fn geom_to_ewkb(bytes: &[u8]) -> Result<Vec<u8>> {
    let header = parse_header(bytes)?;
    let wkb = &bytes[header.wkb_offset..];
    if wkb.len() < 5 {
        return Err(RepoError::InvalidGpkgGeometryLength {
            len: wkb.len(),
            minimum: 5,
        });
    }
    let wkb_le = wkb[0] == 1;
    let type_word = if wkb_le {
        LittleEndian::read_u32(&wkb[1..5])
    } else {
        BigEndian::read_u32(&wkb[1..5])
    };
    let zm = (type_word % 10000) / 1000;
    let base = type_word % 1000;
    let has_z = zm == 1 || zm == 3;
    let has_m = zm == 2 || zm == 3;
    let has_srid = header.srid != 0;

    let mut ewkb_type = base;
    if has_z {
        ewkb_type |= 0x8000_0000;
    }
    if has_m {
        ewkb_type |= 0x4000_0000;
    }
    if has_srid {
        ewkb_type |= 0x2000_0000;
    }

    let mut out = Vec::with_capacity(wkb.len() + 4);
    out.push(wkb[0]);
    if wkb_le {
        out.extend_from_slice(&ewkb_type.to_le_bytes());
        if has_srid {
            out.extend_from_slice(&header.srid.to_le_bytes());
        }
    } else {
        out.extend_from_slice(&ewkb_type.to_be_bytes());
        if has_srid {
            out.extend_from_slice(&header.srid.to_be_bytes());
        }
    }
    out.extend_from_slice(&wkb[5..]);
    Ok(out)
}

/// Parse a hex-encoded EWKB string (as produced by `geom_to_ewkb`, or by any
/// PostGIS-flavoured tool) into a GPB blob.
pub fn hexewkb_to_geom(hex_str: &str) -> Result<Vec<u8>> {
    let bytes = hex::decode(hex_str)
        .map_err(|err| RepoError::BadGeometry(format!("invalid hex ewkb: {err}")))?;
    if bytes.len() < 5 {
        return Err(RepoError::InvalidGpkgGeometryLength {
            len: bytes.len(),
            minimum: 5,
        });
    }
    let is_le = bytes[0] == 1;
    let ewkb_type = if is_le {
        LittleEndian::read_u32(&bytes[1..5])
    } else {
        BigEndian::read_u32(&bytes[1..5])
    };
    let has_z = ewkb_type & 0x8000_0000 != 0;
    let has_m = ewkb_type & 0x4000_0000 != 0;
    let has_srid = ewkb_type & 0x2000_0000 != 0;
    let base = ewkb_type & 0x1FFF_FFFF;

    let mut offset = 5;
    let srid = if has_srid {
        if bytes.len() < offset + 4 {
            return Err(RepoError::InvalidGpkgGeometryLength {
                len: bytes.len(),
                minimum: offset + 4,
            });
        }
        let s = if is_le {
            LittleEndian::read_i32(&bytes[offset..offset + 4])
        } else {
            BigEndian::read_i32(&bytes[offset..offset + 4])
        };
        offset += 4;
        s
    } else {
        0
    };

    let zm = match (has_z, has_m) {
        (false, false) => 0,
        (true, false) => 1,
        (false, true) => 2,
        (true, true) => 3,
    };
    let wkb_type = zm * 1000 + base;

    let body = &bytes[offset..];
    let empty = is_body_empty(body, base, has_z, has_m, is_le)?;

    let mut wkb = Vec::with_capacity(body.len() + 5);
    wkb.push(bytes[0]);
    if is_le {
        wkb.extend_from_slice(&wkb_type.to_le_bytes());
    } else {
        wkb.extend_from_slice(&wkb_type.to_be_bytes());
    }
    wkb.extend_from_slice(body);

    let mut out = Vec::with_capacity(wkb.len() + 8);
    out.extend_from_slice(&GPB_MAGIC);
    out.push(0);
    out.push(0x01 | if empty { 0x10 } else { 0 });
    out.extend_from_slice(&srid.to_le_bytes());
    out.extend_from_slice(&wkb);
    Ok(out)
}

fn is_body_empty(body: &[u8], base: u32, has_z: bool, has_m: bool, is_le: bool) -> Result<bool> {
    if base == 1 {
        // Point: empty iff every ordinate is NaN.
        let dims = 2 + usize::from(has_z) + usize::from(has_m);
        if body.len() < dims * 8 {
            return Err(RepoError::InvalidGpkgGeometryLength {
                len: body.len(),
                minimum: dims * 8,
            });
        }
        let read = |i: usize| -> f64 {
            let raw = &body[i * 8..i * 8 + 8];
            if is_le {
                LittleEndian::read_f64(raw)
            } else {
                BigEndian::read_f64(raw)
            }
        };
        Ok((0..dims).all(|i| read(i).is_nan()))
    } else {
        if body.len() < 4 {
            return Err(RepoError::InvalidGpkgGeometryLength {
                len: body.len(),
                minimum: 4,
            });
        }
        let count = if is_le {
            LittleEndian::read_u32(&body[0..4])
        } else {
            BigEndian::read_u32(&body[0..4])
        };
        Ok(count == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::Point;

    fn sample_point_gpb() -> Vec<u8> {
        wkb_to_gpkg_geometry(Point::new(1.5, -2.25), 4326).unwrap()
    }

    #[test]
    fn parse_gpkg_geom_reads_header() {
        let blob = sample_point_gpb();
        let (offset, is_le, srid) = parse_gpkg_geom(&blob).unwrap();
        assert_eq!(offset, 8);
        assert!(is_le);
        assert_eq!(srid, 4326);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut blob = sample_point_gpb();
        blob[0] = b'X';
        assert!(matches!(
            parse_gpkg_geom(&blob),
            Err(RepoError::BadGeometry(_))
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        let blob = [0u8; 4];
        assert!(matches!(
            parse_gpkg_geom(&blob),
            Err(RepoError::InvalidGpkgGeometryLength { .. })
        ));
    }

    #[test]
    fn gpkg_geometry_to_wkb_roundtrips_through_wkb_to_gpkg_geometry() {
        let blob = sample_point_gpb();
        let wkb = gpkg_geometry_to_wkb(&blob).unwrap();
        let rewrapped = wkb_to_gpkg_geometry(wkb, 4326).unwrap();
        let envelope_a = geom_envelope(&blob).unwrap();
        let envelope_b = geom_envelope(&rewrapped).unwrap();
        assert_eq!(envelope_a, envelope_b);
    }

    #[test]
    fn envelope_matches_point_coordinates() {
        let blob = sample_point_gpb();
        let (minx, maxx, miny, maxy) = geom_envelope(&blob).unwrap().unwrap();
        assert_eq!((minx, maxx, miny, maxy), (1.5, 1.5, -2.25, -2.25));
    }

    #[test]
    fn ewkb_round_trip_preserves_srid_and_body() {
        let blob = sample_point_gpb();
        let ewkb = geom_to_ewkb(&blob).unwrap();
        // byte 0 endianness, bytes 1..5 type word with SRID flag set.
        assert_eq!(ewkb[0], 1);
        let type_word = LittleEndian::read_u32(&ewkb[1..5]);
        assert_ne!(type_word & 0x2000_0000, 0);

        let hex_str = hex::encode(&ewkb);
        let back = hexewkb_to_geom(&hex_str).unwrap();
        let envelope = geom_envelope(&back).unwrap().unwrap();
        assert_eq!(envelope, (1.5, 1.5, -2.25, -2.25));
        let (_, _, srid) = parse_gpkg_geom(&back).unwrap();
        assert_eq!(srid, 4326);
    }

    #[test]
    fn empty_point_has_no_envelope_after_hexewkb_round_trip() {
        let empty_wkb: Vec<u8> = {
            let mut v = vec![1u8];
            v.extend_from_slice(&1u32.to_le_bytes());
            v.extend_from_slice(&f64::NAN.to_le_bytes());
            v.extend_from_slice(&f64::NAN.to_le_bytes());
            v
        };
        let hex_str = hex::encode(&empty_wkb);
        let blob = hexewkb_to_geom(&hex_str).unwrap();
        assert_eq!(geom_envelope(&blob).unwrap(), None);
    }
}
