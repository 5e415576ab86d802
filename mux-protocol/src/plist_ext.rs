//! Tagged-value accessors over [`plist::Value`]. The plist command
//! protocol is dynamically typed on the wire; these accessors turn a
//! missing key or a type mismatch into a recoverable `None` rather than
//! a panic, per Design Note "Dynamic typing at the wire".

pub trait PlistDictExt {
    fn as_str_field(&self, key: &str) -> Option<&str>;
    fn as_u64_field(&self, key: &str) -> Option<u64>;
    fn as_bool_field(&self, key: &str) -> Option<bool>;
    fn as_data_field(&self, key: &str) -> Option<&[u8]>;
    fn as_dict_field(&self, key: &str) -> Option<&plist::Dictionary>;
    fn as_array_field(&self, key: &str) -> Option<&Vec<plist::Value>>;
}

impl PlistDictExt for plist::Dictionary {
    fn as_str_field(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_string())
    }

    fn as_u64_field(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_unsigned_integer())
    }

    fn as_bool_field(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_boolean())
    }

    fn as_data_field(&self, key: &str) -> Option<&[u8]> {
        self.get(key).and_then(|v| v.as_data())
    }

    fn as_dict_field(&self, key: &str) -> Option<&plist::Dictionary> {
        self.get(key).and_then(|v| v.as_dictionary())
    }

    fn as_array_field(&self, key: &str) -> Option<&Vec<plist::Value>> {
        self.get(key).and_then(|v| v.as_array())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_none() {
        let dict = plist::Dictionary::new();
        assert_eq!(dict.as_str_field("MessageType"), None);
    }

    #[test]
    fn wrong_type_is_none() {
        let mut dict = plist::Dictionary::new();
        dict.insert("DeviceID".into(), plist::Value::String("not a number".into()));
        assert_eq!(dict.as_u64_field("DeviceID"), None);
    }

    #[test]
    fn present_key_round_trips() {
        let mut dict = plist::Dictionary::new();
        dict.insert("DeviceID".into(), 7u64.into());
        dict.insert("AutoMonitor".into(), true.into());
        assert_eq!(dict.as_u64_field("DeviceID"), Some(7));
        assert_eq!(dict.as_bool_field("AutoMonitor"), Some(true));
    }
}
