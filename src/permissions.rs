//! Runtime permission gate.
//!
//! Android requires the user to grant radio and location permissions before
//! an app may scan or connect. Other platforms handle this outside the app
//! (Info.plist on iOS and macOS, group membership on Linux), so the gate
//! passes unconditionally there.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

/// First Android API level with the split `BLUETOOTH_SCAN` / `BLUETOOTH_CONNECT` model.
pub const ANDROID_GRANULAR_PERMISSIONS_API_LEVEL: u32 = 31;

/// A runtime permission the gate may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Permission {
    /// `android.permission.BLUETOOTH_SCAN`.
    BluetoothScan,
    /// `android.permission.BLUETOOTH_CONNECT`.
    BluetoothConnect,
    /// `android.permission.ACCESS_FINE_LOCATION`.
    AccessFineLocation,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BluetoothScan => write!(f, "android.permission.BLUETOOTH_SCAN"),
            Self::BluetoothConnect => write!(f, "android.permission.BLUETOOTH_CONNECT"),
            Self::AccessFineLocation => write!(f, "android.permission.ACCESS_FINE_LOCATION"),
        }
    }
}

/// Outcome of a single permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PermissionStatus {
    /// The user granted the permission.
    Granted,
    /// The user denied the permission.
    Denied,
    /// The user denied the permission and asked not to be prompted again.
    NeverAskAgain,
}

impl PermissionStatus {
    /// Check if granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// The platform the app runs on, as far as permissions are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Platform {
    /// Android, with the device API level if known.
    Android {
        /// Device API level. Unknown levels are treated as legacy.
        api_level: Option<u32>,
    },
    /// iOS.
    Ios,
    /// macOS, Linux, or Windows.
    Desktop,
}

impl Platform {
    /// Detect the platform this binary was built for.
    ///
    /// The Android API level cannot be read without a JVM handle, so it is
    /// left unknown; use [`Platform::Android`] directly to supply it.
    pub fn detect() -> Self {
        if cfg!(target_os = "android") {
            Self::Android { api_level: None }
        } else if cfg!(target_os = "ios") {
            Self::Ios
        } else {
            Self::Desktop
        }
    }

    /// Permissions that must be granted before scanning, in request order.
    pub fn required_permissions(&self) -> Vec<Permission> {
        match self {
            Self::Android { api_level } => {
                if api_level.unwrap_or(0) < ANDROID_GRANULAR_PERMISSIONS_API_LEVEL {
                    vec![Permission::AccessFineLocation]
                } else {
                    vec![
                        Permission::BluetoothScan,
                        Permission::BluetoothConnect,
                        Permission::AccessFineLocation,
                    ]
                }
            }
            Self::Ios | Self::Desktop => Vec::new(),
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::detect()
    }
}

/// Prompt text shown alongside a permission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rationale {
    /// Dialog title.
    pub title: &'static str,
    /// Dialog body.
    pub message: &'static str,
    /// Label of the accept button.
    pub button_positive: &'static str,
}

/// Rationale used for every request made by the gate.
pub const BLE_RATIONALE: Rationale = Rationale {
    title: "Location Permission",
    message: "Bluetooth Low Energy requires Location",
    button_positive: "OK",
};

/// Platform hook that actually prompts the user.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PermissionRequester: Send + Sync {
    /// Request one permission, showing the OS prompt if needed.
    async fn request(&self, permission: Permission, rationale: &Rationale) -> PermissionStatus;
}

/// Requester for builds with no permission bridge; denies everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPermissionBridge;

#[async_trait]
impl PermissionRequester for NoPermissionBridge {
    async fn request(&self, permission: Permission, _rationale: &Rationale) -> PermissionStatus {
        warn!(
            "No permission bridge installed, treating {} as denied",
            permission
        );
        PermissionStatus::Denied
    }
}

/// Asks for every permission the platform needs before BLE use.
#[derive(Clone)]
pub struct PermissionGate {
    platform: Platform,
    requester: Arc<dyn PermissionRequester>,
}

impl PermissionGate {
    /// Create a gate for a platform.
    pub fn new(platform: Platform, requester: Arc<dyn PermissionRequester>) -> Self {
        Self {
            platform,
            requester,
        }
    }

    /// The platform this gate was created for.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Request all required permissions.
    ///
    /// Every required permission is requested in order, and the result is
    /// `true` only if all of them were granted. A denial is not retried.
    pub async fn request_permissions(&self) -> bool {
        let required = self.platform.required_permissions();
        if required.is_empty() {
            debug!("No runtime permissions needed on {:?}", self.platform);
            return true;
        }

        let mut all_granted = true;
        for permission in required {
            let status = self.requester.request(permission, &BLE_RATIONALE).await;
            debug!("Permission {} -> {:?}", permission, status);
            all_granted &= status.is_granted();
        }

        if all_granted {
            info!("All Bluetooth permissions granted");
        } else {
            warn!("Bluetooth permissions denied");
        }

        all_granted
    }
}

impl fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionGate")
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_required_permissions() {
        assert_eq!(
            Platform::Android {
                api_level: Some(30)
            }
            .required_permissions(),
            vec![Permission::AccessFineLocation]
        );
        assert_eq!(
            Platform::Android { api_level: None }.required_permissions(),
            vec![Permission::AccessFineLocation]
        );
        assert_eq!(
            Platform::Android {
                api_level: Some(33)
            }
            .required_permissions(),
            vec![
                Permission::BluetoothScan,
                Permission::BluetoothConnect,
                Permission::AccessFineLocation,
            ]
        );
        assert!(Platform::Ios.required_permissions().is_empty());
    }

    #[tokio::test]
    async fn test_no_runtime_model_grants() {
        let mut requester = MockPermissionRequester::new();
        requester.expect_request().never();

        let gate = PermissionGate::new(Platform::Desktop, Arc::new(requester));
        assert!(gate.request_permissions().await);
    }

    #[tokio::test]
    async fn test_modern_android_requests_in_order() {
        let mut requester = MockPermissionRequester::new();
        let mut seq = Sequence::new();
        for permission in [
            Permission::BluetoothScan,
            Permission::BluetoothConnect,
            Permission::AccessFineLocation,
        ] {
            requester
                .expect_request()
                .with(eq(permission), eq(BLE_RATIONALE))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| PermissionStatus::Granted);
        }

        let gate = PermissionGate::new(
            Platform::Android {
                api_level: Some(31),
            },
            Arc::new(requester),
        );
        assert!(gate.request_permissions().await);
    }

    #[tokio::test]
    async fn test_single_denial_fails_whole_request() {
        let mut requester = MockPermissionRequester::new();
        requester
            .expect_request()
            .returning(|permission, _| match permission {
                Permission::BluetoothConnect => PermissionStatus::Denied,
                _ => PermissionStatus::Granted,
            });

        let gate = PermissionGate::new(
            Platform::Android {
                api_level: Some(34),
            },
            Arc::new(requester),
        );
        assert!(!gate.request_permissions().await);
    }

    #[tokio::test]
    async fn test_legacy_android_location_only() {
        let mut requester = MockPermissionRequester::new();
        requester
            .expect_request()
            .with(eq(Permission::AccessFineLocation), eq(BLE_RATIONALE))
            .times(1)
            .returning(|_, _| PermissionStatus::NeverAskAgain);

        let gate = PermissionGate::new(
            Platform::Android {
                api_level: Some(29),
            },
            Arc::new(requester),
        );
        assert!(!gate.request_permissions().await);
    }

    #[tokio::test]
    async fn test_no_bridge_denies() {
        let gate = PermissionGate::new(
            Platform::Android { api_level: None },
            Arc::new(NoPermissionBridge),
        );
        assert!(!gate.request_permissions().await);
    }
}
