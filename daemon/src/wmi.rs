/// Process creation events from WMI (`__InstanceCreationEvent` on `Win32_Process`).
///
/// Each acquisition step maps onto one COM/WMI resource:
///   Runtime       CoInitializeEx (multithreaded apartment)
///   Locator       WbemLocator
///   Connection    IWbemLocator::ConnectServer("ROOT\CIMV2")
///   Security      CoSetProxyBlanket on the services proxy
///   Stub          UnsecuredApartment stub around a Rust IWbemObjectSink
///   Subscription  IWbemServices::ExecNotificationQueryAsync
///
/// WMI calls `Indicate` on its own delivery thread; the sink only extracts pids
/// and forwards them into the notification channel.
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use windows::core::{implement, w, BSTR, HRESULT, IUnknown, Interface};
use windows::Win32::Foundation::E_POINTER;
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoSetProxyBlanket, CoUninitialize, CLSCTX_INPROC_SERVER,
    CLSCTX_LOCAL_SERVER, COINIT_MULTITHREADED, EOAC_NONE, RPC_C_AUTHN_LEVEL_CALL,
    RPC_C_IMP_LEVEL_IMPERSONATE,
};
use windows::Win32::System::Rpc::{RPC_C_AUTHN_WINNT, RPC_C_AUTHZ_NONE};
use windows::Win32::System::Variant::{VariantClear, VARIANT, VT_DISPATCH, VT_UNKNOWN};
use windows::Win32::System::Wmi::{
    IUnsecuredApartment, IWbemClassObject, IWbemLocator, IWbemObjectSink, IWbemObjectSink_Impl,
    IWbemServices, UnsecuredApartment, WbemLocator, WBEM_FLAG_SEND_STATUS,
};

use crate::event::{CreationNotification, NotificationBatch};
use crate::subscription::{EventBackend, Step};

const NAMESPACE: &str = r"ROOT\CIMV2";

/// WQL query selecting process creation, delivered within `within` of the event.
pub fn creation_query(within: Duration) -> String {
    format!(
        "SELECT * FROM __InstanceCreationEvent WITHIN {} WHERE TargetInstance ISA 'Win32_Process'",
        within.as_secs().max(1)
    )
}

pub struct WmiBackend {
    within: Duration,
    tx: mpsc::Sender<NotificationBatch>,
    com_initialized: bool,
    locator: Option<IWbemLocator>,
    services: Option<IWbemServices>,
    apartment: Option<IUnsecuredApartment>,
    stub: Option<IWbemObjectSink>,
}

impl WmiBackend {
    pub fn new(within: Duration, tx: mpsc::Sender<NotificationBatch>) -> Self {
        Self {
            within,
            tx,
            com_initialized: false,
            locator: None,
            services: None,
            apartment: None,
            stub: None,
        }
    }

    fn services(&self) -> Result<&IWbemServices> {
        self.services.as_ref().context("not connected")
    }

    fn stub(&self) -> Result<&IWbemObjectSink> {
        self.stub.as_ref().context("no notification stub")
    }
}

impl EventBackend for WmiBackend {
    fn acquire(&mut self, step: Step) -> Result<()> {
        match step {
            Step::Runtime => {
                unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) }
                    .ok()
                    .context("CoInitializeEx failed")?;
                self.com_initialized = true;
            }
            Step::Locator => {
                let locator: IWbemLocator =
                    unsafe { CoCreateInstance(&WbemLocator, None, CLSCTX_INPROC_SERVER) }
                        .context("CoCreateInstance(WbemLocator) failed")?;
                self.locator = Some(locator);
            }
            Step::Connection => {
                let locator = self.locator.as_ref().context("no locator")?;
                let services = unsafe {
                    locator.ConnectServer(
                        &BSTR::from(NAMESPACE),
                        &BSTR::new(),
                        &BSTR::new(),
                        &BSTR::new(),
                        0,
                        &BSTR::new(),
                        None,
                    )
                }
                .with_context(|| format!("ConnectServer({NAMESPACE}) failed"))?;
                self.services = Some(services);
            }
            Step::Security => unsafe {
                CoSetProxyBlanket(
                    self.services()?,
                    RPC_C_AUTHN_WINNT,
                    RPC_C_AUTHZ_NONE,
                    None,
                    RPC_C_AUTHN_LEVEL_CALL,
                    RPC_C_IMP_LEVEL_IMPERSONATE,
                    None,
                    EOAC_NONE,
                )
                .context("CoSetProxyBlanket failed")?;
            },
            Step::Stub => {
                let apartment: IUnsecuredApartment =
                    unsafe { CoCreateInstance(&UnsecuredApartment, None, CLSCTX_LOCAL_SERVER) }
                        .context("CoCreateInstance(UnsecuredApartment) failed")?;
                let sink: IWbemObjectSink = CreationSink {
                    tx: self.tx.clone(),
                }
                .into();
                let stub: IUnknown = unsafe { apartment.CreateObjectStub(&sink) }
                    .context("CreateObjectStub failed")?;
                self.stub = Some(stub.cast().context("stub is not an IWbemObjectSink")?);
                self.apartment = Some(apartment);
            }
            Step::Subscription => {
                let query = creation_query(self.within);
                debug!(%query, "subscribing");
                unsafe {
                    self.services()?.ExecNotificationQueryAsync(
                        &BSTR::from("WQL"),
                        &BSTR::from(query.as_str()),
                        WBEM_FLAG_SEND_STATUS,
                        None,
                        self.stub()?,
                    )
                }
                .context("ExecNotificationQueryAsync failed")?;
            }
        }
        Ok(())
    }

    fn release(&mut self, step: Step) -> Result<()> {
        match step {
            Step::Subscription => {
                unsafe { self.services()?.CancelAsyncCall(self.stub()?) }
                    .context("CancelAsyncCall failed")?;
            }
            Step::Stub => {
                self.stub = None;
                self.apartment = None;
            }
            Step::Security => {}
            Step::Connection => self.services = None,
            Step::Locator => self.locator = None,
            Step::Runtime => {
                if std::mem::take(&mut self.com_initialized) {
                    unsafe { CoUninitialize() };
                }
            }
        }
        Ok(())
    }
}

/// Receives event objects from WMI and forwards their process ids.
#[implement(IWbemObjectSink)]
struct CreationSink {
    tx: mpsc::Sender<NotificationBatch>,
}

impl IWbemObjectSink_Impl for CreationSink {
    fn Indicate(
        &self,
        lobjectcount: i32,
        apobjarray: *const Option<IWbemClassObject>,
    ) -> windows::core::Result<()> {
        let objects = if apobjarray.is_null() || lobjectcount <= 0 {
            &[][..]
        } else {
            unsafe { std::slice::from_raw_parts(apobjarray, lobjectcount as usize) }
        };

        let mut batch = NotificationBatch::with_capacity(objects.len());
        for event in objects.iter().flatten() {
            match target_pid(event) {
                Ok(pid) => batch.push(CreationNotification::new(pid)),
                Err(e) => warn!("skipping creation event: {e}"),
            }
        }

        // The receiver is gone only during shutdown; dropping the batch is fine then.
        let _ = self.tx.blocking_send(batch);
        Ok(())
    }

    fn SetStatus(
        &self,
        _lflags: i32,
        _hresult: HRESULT,
        _strparam: &BSTR,
        _pobjparam: Option<&IWbemClassObject>,
    ) -> windows::core::Result<()> {
        Ok(())
    }
}

/// A `VARIANT` cleared on drop.
struct OwnedVariant(VARIANT);

impl Drop for OwnedVariant {
    fn drop(&mut self) {
        unsafe {
            let _ = VariantClear(&mut self.0);
        }
    }
}

/// Reads `TargetInstance.ProcessId` from an `__InstanceCreationEvent` object.
fn target_pid(event: &IWbemClassObject) -> windows::core::Result<u32> {
    let mut target = OwnedVariant(VARIANT::default());
    unsafe { event.Get(w!("TargetInstance"), 0, &mut target.0, None, None)? };

    let process: IWbemClassObject = unsafe {
        let inner = &target.0.Anonymous.Anonymous;
        if inner.vt != VT_UNKNOWN && inner.vt != VT_DISPATCH {
            return Err(E_POINTER.into());
        }
        match inner.Anonymous.punkVal.as_ref() {
            Some(unknown) => unknown.cast()?,
            None => return Err(E_POINTER.into()),
        }
    };

    let mut pid = OwnedVariant(VARIANT::default());
    unsafe {
        process.Get(w!("ProcessId"), 0, &mut pid.0, None, None)?;
        // CIM uint32 arrives as VT_I4.
        Ok(pid.0.Anonymous.Anonymous.Anonymous.lVal as u32)
    }
}
