use crate::gateway::{Attachment, OutgoingMessage};
use crate::wireguard;

/// What a user is told once their machine is ready.
pub struct AccessDetails<'a> {
    pub contact: &'a str,
    pub machine: &'a str,
    pub user: &'a str,
    pub password: &'a str,
    /// Rendered WireGuard profile, attached when present.
    pub profile: Option<&'a str>,
}

/// Build the access message.
///
/// A non-empty `test_recipient` receives the message instead of the contact;
/// the body then names the original contact unless the two are the same.
pub fn compose(details: &AccessDetails<'_>, test_recipient: &str) -> OutgoingMessage {
    let to = if test_recipient.is_empty() {
        details.contact
    } else {
        test_recipient
    };

    let mut body = format!(
        "Hello,\n\n\
         Your lab environment is now ready!\n\n\
         Machine: {}\n\
         Username: {}\n\
         Password: {}\n\n",
        details.machine, details.user, details.password
    );

    if !test_recipient.is_empty() && details.contact != to {
        body.push_str(&format!("[TEST MODE] Original recipient: {}\n\n", details.contact));
    }

    let attachment = details.profile.map(|profile| Attachment {
        filename: wireguard::profile_filename(details.user),
        content_type: wireguard::PROFILE_CONTENT_TYPE.to_string(),
        content: profile.as_bytes().to_vec(),
    });

    if let Some(a) = &attachment {
        body.push_str(&format!(
            "A WireGuard VPN configuration file ({}) is attached to this email.\n\
             To connect to the lab network:\n\
             1. Install WireGuard from https://www.wireguard.com/install/\n\
             2. Import the attached configuration file\n\
             3. Activate the tunnel\n\n",
            a.filename
        ));
    }

    body.push_str(
        "This password was generated automatically for your lab session.\n\n\
         Best regards,\n\
         Lab Provisioning\n",
    );

    OutgoingMessage {
        to: to.to_string(),
        subject: format!("Lab Access - Machine: {}", details.machine),
        body,
        attachment,
    }
}
