use super::{ChassisControl, ChassisStatus, PowerRestorePolicy};
use ipmi_rs::connection::{CompletionCode, IpmiCommand, Message, NetFn, ParseResponseError};

const CMD_GET_CHASSIS_STATUS: u8 = 0x01;
const CMD_CHASSIS_CONTROL: u8 = 0x02;
const CMD_SET_POWER_RESTORE_POLICY: u8 = 0x06;

pub struct GetChassisStatus;

impl From<GetChassisStatus> for Message {
    fn from(_: GetChassisStatus) -> Message {
        Message::new_request(NetFn::Chassis, CMD_GET_CHASSIS_STATUS, Vec::new())
    }
}

impl IpmiCommand for GetChassisStatus {
    type Output = ChassisStatus;
    type Error = ();

    fn parse_response(
        completion_code: CompletionCode,
        data: &[u8],
    ) -> Result<Self::Output, ParseResponseError<Self::Error>> {
        Self::check_cc_success(completion_code)?;
        ChassisStatus::from_data(data).ok_or(ParseResponseError::NotEnoughData)
    }
}

pub struct SetChassisControl(pub ChassisControl);

impl From<SetChassisControl> for Message {
    fn from(cmd: SetChassisControl) -> Message {
        Message::new_request(NetFn::Chassis, CMD_CHASSIS_CONTROL, vec![cmd.0 as u8])
    }
}

impl IpmiCommand for SetChassisControl {
    type Output = ();
    type Error = ();

    fn parse_response(
        completion_code: CompletionCode,
        _data: &[u8],
    ) -> Result<Self::Output, ParseResponseError<Self::Error>> {
        Self::check_cc_success(completion_code)
    }
}

pub struct SetPowerRestorePolicy(pub PowerRestorePolicy);

impl From<SetPowerRestorePolicy> for Message {
    fn from(cmd: SetPowerRestorePolicy) -> Message {
        Message::new_request(
            NetFn::Chassis,
            CMD_SET_POWER_RESTORE_POLICY,
            vec![cmd.0.code()],
        )
    }
}

impl IpmiCommand for SetPowerRestorePolicy {
    /// Bitmask of the policies the BMC supports.
    type Output = u8;
    type Error = ();

    fn parse_response(
        completion_code: CompletionCode,
        data: &[u8],
    ) -> Result<Self::Output, ParseResponseError<Self::Error>> {
        Self::check_cc_success(completion_code)?;
        data.first()
            .copied()
            .ok_or(ParseResponseError::NotEnoughData)
    }
}
