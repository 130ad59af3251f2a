//! Opcode registry
//!
//! Every frame starts with a single opcode byte. The general command space and the
//! DFU/resource/file/dial protocols share the same byte range; a few values overlap
//! (battery and DFU status check are both 0x06). Requests are correlated against the
//! single pending request, so the overlap only matters for unsolicited frames, which
//! are always interpreted in the general command space.

/// General command space: settings, queries and device-initiated reports
pub mod command {
    pub const BATTERY: u8 = 0x06;
    pub const SET_TIME: u8 = 0x08;
    pub const CAMERA: u8 = 0x0C;
    pub const FIND_DEVICE: u8 = 0x10;
    pub const FIND_PHONE: u8 = 0x11;
    pub const LOW_POWER: u8 = 0x12;
    pub const STEP_UPDATE: u8 = 0x13;
    pub const SPORT_STATE: u8 = 0x14;
    pub const DIAL_INDEX: u8 = 0x15;
    pub const GESTURE_TOUCH: u8 = 0x16;
    pub const FLIP_WRIST: u8 = 0x17;
    pub const TOUCH_SLEEP: u8 = 0x18;
    pub const DATA_UPDATE: u8 = 0x19;
    pub const REALTIME_HEART_RATE: u8 = 0x1E;
    pub const MEASUREMENT: u8 = 0x69;
    pub const WEAR_CALIBRATION: u8 = 0x6A;
}

/// Firmware update, resource, file and dial protocols
pub mod dfu {
    pub const START_DFU: u8 = 0x01;
    pub const INIT_PARAMETERS: u8 = 0x02;
    pub const RECEIVE_IMAGE: u8 = 0x03;
    pub const VALIDATE: u8 = 0x04;
    pub const ACTIVATE_AND_RESET: u8 = 0x05;
    pub const CHECK_STATUS: u8 = 0x06;

    pub const LOCATION: u8 = 0x20;
    pub const INIT_RESOURCE: u8 = 0x21;
    pub const RECEIVE_RESOURCE: u8 = 0x22;
    pub const VALIDATE_RESOURCE: u8 = 0x23;
    pub const DELETE_RESOURCE: u8 = 0x24;

    pub const TEMPERATURE_LIST: u8 = 0x25;
    pub const MANUAL_TEMPERATURE: u8 = 0x26;
    pub const SLEEP_LIST: u8 = 0x27;
    pub const MANUAL_HEART_RATE: u8 = 0x28;
    pub const LONG_CONTACTS: u8 = 0x29;
    pub const BLOOD_OXYGEN_LIST: u8 = 0x2A;
    pub const ALARM_INFO: u8 = 0x2C;
    pub const CONTACTS: u8 = 0x2D;
    pub const PHONE_BIND_NAME: u8 = 0x2E;
    pub const QR_CODE: u8 = 0x2F;

    pub const FILE_REQUEST: u8 = 0x30;
    pub const FILE_INIT: u8 = 0x31;
    pub const FILE_PACKET: u8 = 0x32;
    pub const FILE_CHECK: u8 = 0x33;

    pub const DIAL_FILE_LIST: u8 = 0x35;
    pub const DIAL_FILE_INIT: u8 = 0x36;
    pub const DIAL_FILE_PACKET: u8 = 0x37;
    pub const DIAL_FILE_CHECK: u8 = 0x38;
    pub const DIAL_FILE_DELETE: u8 = 0x39;
    pub const DIAL_PARAMETER: u8 = 0x3A;

    pub const SPORT_SUMMARY_REQUEST: u8 = 0x41;
    pub const SPORT_SUMMARY_RESPONSE: u8 = 0x42;
    pub const SPORT_DATA_REQUEST: u8 = 0x43;
    pub const SPORT_DETAIL_SUMMARY_RESPONSE: u8 = 0x44;
    pub const SPORT_DETAIL_RESPONSE: u8 = 0x45;
    pub const SPORT_DETAIL_CHECKED: u8 = 0x46;
    pub const BLOOD_GLUCOSE_LIST: u8 = 0x47;
    pub const MAP_NAVIGATION: u8 = 0x48;
    pub const MANUAL_BLOOD_OXYGEN: u8 = 0x49;
    pub const SET_USER_PROFILE: u8 = 0x4A;
    pub const ONLINE_AGPS: u8 = 0x54;
    pub const SEDENTARY_REMINDER: u8 = 0x5B;
    pub const BLOOD_OXYGEN_INTERVAL_LIST: u8 = 0x5F;

    pub const ECG_LIST_REQUEST: u8 = 0x70;
    pub const ECG_LIST_RESPONSE: u8 = 0x71;
    pub const ECG_DATA_REQUEST: u8 = 0x72;
    pub const ECG_DATA_RESPONSE: u8 = 0x73;
    pub const TEMPERATURE_INTERVAL_LIST: u8 = 0x74;
    pub const PRAYER: u8 = 0x7A;

    pub const QUERY_FILES: u8 = 0x80;
    pub const DELETE_FILE: u8 = 0x81;
    pub const GET_AUDIO: u8 = 0x82;

    pub const ALARM_RESPONSE: u8 = 0xFF;
}

/// Opcodes whose payload begins with a little-endian u16 packet index
pub const SEQUENCED: &[u8] = &[
    dfu::RECEIVE_IMAGE,
    dfu::RECEIVE_RESOURCE,
    dfu::LONG_CONTACTS,
    dfu::FILE_PACKET,
    dfu::DIAL_FILE_PACKET,
];

/// Human readable name for logging
///
/// General command names win for overlapping values.
pub fn name(opcode: u8) -> &'static str {
    match opcode {
        command::BATTERY => "BATTERY",
        command::SET_TIME => "SET_TIME",
        command::CAMERA => "CAMERA",
        command::FIND_DEVICE => "FIND_DEVICE",
        command::FIND_PHONE => "FIND_PHONE",
        command::LOW_POWER => "LOW_POWER",
        command::STEP_UPDATE => "STEP_UPDATE",
        command::SPORT_STATE => "SPORT_STATE",
        command::DIAL_INDEX => "DIAL_INDEX",
        command::GESTURE_TOUCH => "GESTURE_TOUCH",
        command::FLIP_WRIST => "FLIP_WRIST",
        command::TOUCH_SLEEP => "TOUCH_SLEEP",
        command::DATA_UPDATE => "DATA_UPDATE",
        command::REALTIME_HEART_RATE => "REALTIME_HEART_RATE",
        command::MEASUREMENT => "MEASUREMENT",
        command::WEAR_CALIBRATION => "WEAR_CALIBRATION",
        dfu::START_DFU => "START_DFU",
        dfu::INIT_PARAMETERS => "INIT_PARAMETERS",
        dfu::RECEIVE_IMAGE => "RECEIVE_IMAGE",
        dfu::VALIDATE => "VALIDATE",
        dfu::ACTIVATE_AND_RESET => "ACTIVATE_AND_RESET",
        dfu::LOCATION => "LOCATION",
        dfu::INIT_RESOURCE => "INIT_RESOURCE",
        dfu::RECEIVE_RESOURCE => "RECEIVE_RESOURCE",
        dfu::VALIDATE_RESOURCE => "VALIDATE_RESOURCE",
        dfu::DELETE_RESOURCE => "DELETE_RESOURCE",
        dfu::TEMPERATURE_LIST => "TEMPERATURE_LIST",
        dfu::MANUAL_TEMPERATURE => "MANUAL_TEMPERATURE",
        dfu::SLEEP_LIST => "SLEEP_LIST",
        dfu::MANUAL_HEART_RATE => "MANUAL_HEART_RATE",
        dfu::LONG_CONTACTS => "LONG_CONTACTS",
        dfu::BLOOD_OXYGEN_LIST => "BLOOD_OXYGEN_LIST",
        dfu::ALARM_INFO => "ALARM_INFO",
        dfu::CONTACTS => "CONTACTS",
        dfu::PHONE_BIND_NAME => "PHONE_BIND_NAME",
        dfu::QR_CODE => "QR_CODE",
        dfu::FILE_REQUEST => "FILE_REQUEST",
        dfu::FILE_INIT => "FILE_INIT",
        dfu::FILE_PACKET => "FILE_PACKET",
        dfu::FILE_CHECK => "FILE_CHECK",
        dfu::DIAL_FILE_LIST => "DIAL_FILE_LIST",
        dfu::DIAL_FILE_INIT => "DIAL_FILE_INIT",
        dfu::DIAL_FILE_PACKET => "DIAL_FILE_PACKET",
        dfu::DIAL_FILE_CHECK => "DIAL_FILE_CHECK",
        dfu::DIAL_FILE_DELETE => "DIAL_FILE_DELETE",
        dfu::DIAL_PARAMETER => "DIAL_PARAMETER",
        dfu::SPORT_SUMMARY_REQUEST => "SPORT_SUMMARY_REQUEST",
        dfu::SPORT_SUMMARY_RESPONSE => "SPORT_SUMMARY_RESPONSE",
        dfu::SPORT_DATA_REQUEST => "SPORT_DATA_REQUEST",
        dfu::SPORT_DETAIL_SUMMARY_RESPONSE => "SPORT_DETAIL_SUMMARY_RESPONSE",
        dfu::SPORT_DETAIL_RESPONSE => "SPORT_DETAIL_RESPONSE",
        dfu::SPORT_DETAIL_CHECKED => "SPORT_DETAIL_CHECKED",
        dfu::BLOOD_GLUCOSE_LIST => "BLOOD_GLUCOSE_LIST",
        dfu::MAP_NAVIGATION => "MAP_NAVIGATION",
        dfu::MANUAL_BLOOD_OXYGEN => "MANUAL_BLOOD_OXYGEN",
        dfu::SET_USER_PROFILE => "SET_USER_PROFILE",
        dfu::ONLINE_AGPS => "ONLINE_AGPS",
        dfu::SEDENTARY_REMINDER => "SEDENTARY_REMINDER",
        dfu::BLOOD_OXYGEN_INTERVAL_LIST => "BLOOD_OXYGEN_INTERVAL_LIST",
        dfu::ECG_LIST_REQUEST => "ECG_LIST_REQUEST",
        dfu::ECG_LIST_RESPONSE => "ECG_LIST_RESPONSE",
        dfu::ECG_DATA_REQUEST => "ECG_DATA_REQUEST",
        dfu::ECG_DATA_RESPONSE => "ECG_DATA_RESPONSE",
        dfu::TEMPERATURE_INTERVAL_LIST => "TEMPERATURE_INTERVAL_LIST",
        dfu::PRAYER => "PRAYER",
        dfu::QUERY_FILES => "QUERY_FILES",
        dfu::DELETE_FILE => "DELETE_FILE",
        dfu::GET_AUDIO => "GET_AUDIO",
        dfu::ALARM_RESPONSE => "ALARM_RESPONSE",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(name(command::BATTERY), "BATTERY");
        assert_eq!(name(dfu::DIAL_FILE_PACKET), "DIAL_FILE_PACKET");
        assert_eq!(name(0x99), "UNKNOWN");
    }

    #[test]
    fn test_packet_opcodes_are_sequenced() {
        assert!(SEQUENCED.contains(&dfu::RECEIVE_IMAGE));
        assert!(SEQUENCED.contains(&dfu::DIAL_FILE_PACKET));
        assert!(!SEQUENCED.contains(&command::BATTERY));
    }
}
