use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(in crate::telegram) enum ValueKind {
    Number,
    Timestamp,
    Text,
    /// Capture timestamp followed by the reading; only the reading is kept.
    StampedNumber,
}

/// Fields of a DSMR 5 telegram that the daemon understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldId {
    P1MessageHeader,
    P1MessageTimestamp,
    EquipmentIdentifier,
    ElectricityActiveTariff,
    ElectricityUsedTariff1,
    ElectricityUsedTariff2,
    ElectricityUsedTariff3,
    ElectricityUsedTariff4,
    ElectricityDeliveredTariff1,
    ElectricityDeliveredTariff2,
    ElectricityDeliveredTariff3,
    ElectricityDeliveredTariff4,
    CurrentElectricityUsage,
    CurrentElectricityDelivery,
    ShortPowerFailureCount,
    LongPowerFailureCount,
    InstantaneousVoltageL1,
    InstantaneousVoltageL2,
    InstantaneousVoltageL3,
    InstantaneousCurrentL1,
    InstantaneousCurrentL2,
    InstantaneousCurrentL3,
    InstantaneousActivePowerL1Positive,
    InstantaneousActivePowerL2Positive,
    InstantaneousActivePowerL3Positive,
    InstantaneousActivePowerL1Negative,
    InstantaneousActivePowerL2Negative,
    InstantaneousActivePowerL3Negative,
    HourlyGasMeterReading,
}

const FIELDS: &[(FieldId, &str, &str, ValueKind)] = &[
    (FieldId::P1MessageHeader, "1-3:0.2.8", "P1_MESSAGE_HEADER", ValueKind::Text),
    (FieldId::P1MessageTimestamp, "0-0:1.0.0", "P1_MESSAGE_TIMESTAMP", ValueKind::Timestamp),
    (FieldId::EquipmentIdentifier, "0-0:96.1.1", "EQUIPMENT_IDENTIFIER", ValueKind::Text),
    (FieldId::ElectricityActiveTariff, "0-0:96.14.0", "ELECTRICITY_ACTIVE_TARIFF", ValueKind::Text),
    (FieldId::ElectricityUsedTariff1, "1-0:1.8.1", "ELECTRICITY_USED_TARIFF_1", ValueKind::Number),
    (FieldId::ElectricityUsedTariff2, "1-0:1.8.2", "ELECTRICITY_USED_TARIFF_2", ValueKind::Number),
    (FieldId::ElectricityUsedTariff3, "1-0:1.8.3", "ELECTRICITY_USED_TARIFF_3", ValueKind::Number),
    (FieldId::ElectricityUsedTariff4, "1-0:1.8.4", "ELECTRICITY_USED_TARIFF_4", ValueKind::Number),
    (FieldId::ElectricityDeliveredTariff1, "1-0:2.8.1", "ELECTRICITY_DELIVERED_TARIFF_1", ValueKind::Number),
    (FieldId::ElectricityDeliveredTariff2, "1-0:2.8.2", "ELECTRICITY_DELIVERED_TARIFF_2", ValueKind::Number),
    (FieldId::ElectricityDeliveredTariff3, "1-0:2.8.3", "ELECTRICITY_DELIVERED_TARIFF_3", ValueKind::Number),
    (FieldId::ElectricityDeliveredTariff4, "1-0:2.8.4", "ELECTRICITY_DELIVERED_TARIFF_4", ValueKind::Number),
    (FieldId::CurrentElectricityUsage, "1-0:1.7.0", "CURRENT_ELECTRICITY_USAGE", ValueKind::Number),
    (FieldId::CurrentElectricityDelivery, "1-0:2.7.0", "CURRENT_ELECTRICITY_DELIVERY", ValueKind::Number),
    (FieldId::ShortPowerFailureCount, "0-0:96.7.21", "SHORT_POWER_FAILURE_COUNT", ValueKind::Number),
    (FieldId::LongPowerFailureCount, "0-0:96.7.9", "LONG_POWER_FAILURE_COUNT", ValueKind::Number),
    (FieldId::InstantaneousVoltageL1, "1-0:32.7.0", "INSTANTANEOUS_VOLTAGE_L1", ValueKind::Number),
    (FieldId::InstantaneousVoltageL2, "1-0:52.7.0", "INSTANTANEOUS_VOLTAGE_L2", ValueKind::Number),
    (FieldId::InstantaneousVoltageL3, "1-0:72.7.0", "INSTANTANEOUS_VOLTAGE_L3", ValueKind::Number),
    (FieldId::InstantaneousCurrentL1, "1-0:31.7.0", "INSTANTANEOUS_CURRENT_L1", ValueKind::Number),
    (FieldId::InstantaneousCurrentL2, "1-0:51.7.0", "INSTANTANEOUS_CURRENT_L2", ValueKind::Number),
    (FieldId::InstantaneousCurrentL3, "1-0:71.7.0", "INSTANTANEOUS_CURRENT_L3", ValueKind::Number),
    (FieldId::InstantaneousActivePowerL1Positive, "1-0:21.7.0", "INSTANTANEOUS_ACTIVE_POWER_L1_POSITIVE", ValueKind::Number),
    (FieldId::InstantaneousActivePowerL2Positive, "1-0:41.7.0", "INSTANTANEOUS_ACTIVE_POWER_L2_POSITIVE", ValueKind::Number),
    (FieldId::InstantaneousActivePowerL3Positive, "1-0:61.7.0", "INSTANTANEOUS_ACTIVE_POWER_L3_POSITIVE", ValueKind::Number),
    (FieldId::InstantaneousActivePowerL1Negative, "1-0:22.7.0", "INSTANTANEOUS_ACTIVE_POWER_L1_NEGATIVE", ValueKind::Number),
    (FieldId::InstantaneousActivePowerL2Negative, "1-0:42.7.0", "INSTANTANEOUS_ACTIVE_POWER_L2_NEGATIVE", ValueKind::Number),
    (FieldId::InstantaneousActivePowerL3Negative, "1-0:62.7.0", "INSTANTANEOUS_ACTIVE_POWER_L3_NEGATIVE", ValueKind::Number),
    (FieldId::HourlyGasMeterReading, "0-1:24.2.1", "HOURLY_GAS_METER_READING", ValueKind::StampedNumber),
];

impl FieldId {
    // FIELDS is declared in enum order.
    fn entry(self) -> &'static (FieldId, &'static str, &'static str, ValueKind) {
        &FIELDS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.entry().2
    }

    pub(in crate::telegram) fn kind(self) -> ValueKind {
        self.entry().3
    }

    /// Looks up a field by OBIS reference. The gas register is accepted on any
    /// M-Bus channel (`0-1`..`0-4`).
    pub fn from_obis(reference: &str) -> Option<Self> {
        if let Some(channel) = reference.strip_suffix(":24.2.1") {
            if matches!(channel, "0-1" | "0-2" | "0-3" | "0-4") {
                return Some(FieldId::HourlyGasMeterReading);
            }
        }
        FIELDS
            .iter()
            .find(|(_, obis, ..)| *obis == reference)
            .map(|(id, ..)| *id)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
