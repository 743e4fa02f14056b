/// Serde adapters for binary key material, stored as base64 in operator facing files.
pub mod base64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: impl AsRef<[u8]>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&::base64::encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: FromBase64,
    {
        let encoded = <&str>::deserialize(deserializer)?;
        let decoded = ::base64::decode(encoded).map_err(de::Error::custom)?;

        T::from_base64(&decoded).ok_or_else(|| de::Error::custom("unexpected decoded length"))
    }

    pub trait FromBase64: Sized {
        fn from_base64(decoded: &[u8]) -> Option<Self>;
    }

    impl FromBase64 for Vec<u8> {
        #[inline]
        fn from_base64(decoded: &[u8]) -> Option<Self> {
            Some(decoded.to_vec())
        }
    }

    impl FromBase64 for [u8; 16] {
        #[inline]
        fn from_base64(decoded: &[u8]) -> Option<Self> {
            fixed(decoded)
        }
    }

    impl FromBase64 for [u8; 32] {
        #[inline]
        fn from_base64(decoded: &[u8]) -> Option<Self> {
            fixed(decoded)
        }
    }

    #[inline]
    fn fixed<const N: usize>(decoded: &[u8]) -> Option<[u8; N]> {
        if decoded.len() != N {
            return None;
        }

        let mut out = [0u8; N];
        out.copy_from_slice(decoded);
        Some(out)
    }
}
