// SPDX-License-Identifier: GPL-2.0-or-later

// Builds an AVCDecoderConfigurationRecord (ISO/IEC 14496-15) from a single
// SPS/PPS pair, the subset every H264 track in this codebase needs.
pub fn build_avcc(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(11 + sps.len() + pps.len());
    out.push(1); // configurationVersion
    out.push(sps.get(1).copied().unwrap_or(0)); // AVCProfileIndication
    out.push(sps.get(2).copied().unwrap_or(0)); // profile_compatibility
    out.push(sps.get(3).copied().unwrap_or(0)); // AVCLevelIndication
    out.push(0xFF); // reserved(6) + lengthSizeMinusOne(2) = 4 byte lengths
    out.push(0xE1); // reserved(3) + numOfSequenceParameterSets(5) = 1
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    out.extend_from_slice(sps);
    out.push(1); // numOfPictureParameterSets
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    out.extend_from_slice(pps);
    out
}

// Reads the profile/level byte triplet out of an SPS to build the RFC 6381
// codec string, e.g. "avc1.640028".
pub fn rfc6381_codec(sps: &[u8]) -> String {
    let profile = sps.get(1).copied().unwrap_or(0);
    let compat = sps.get(2).copied().unwrap_or(0);
    let level = sps.get(3).copied().unwrap_or(0);
    format!("avc1.{profile:02x}{compat:02x}{level:02x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_avcc() {
        let sps = [0x67, 0x64, 0x00, 0x28, 0xAC];
        let pps = [0x68, 0xEB];
        let avcc = build_avcc(&sps, &pps);
        assert_eq!(1, avcc[0]);
        assert_eq!(0x64, avcc[1]);
        assert_eq!(0x00, avcc[2]);
        assert_eq!(0x28, avcc[3]);
        assert_eq!(0xFF, avcc[4]);
        assert_eq!(0xE1, avcc[5]);
        assert_eq!([0, 5], avcc[6..8]);
        assert_eq!(sps, avcc[8..13]);
        assert_eq!(1, avcc[13]);
        assert_eq!([0, 2], avcc[14..16]);
        assert_eq!(pps, avcc[16..18]);
    }

    #[test]
    fn test_rfc6381_codec() {
        let sps = [0x67, 0x64, 0x00, 0x28];
        assert_eq!("avc1.640028", rfc6381_codec(&sps));
    }
}
