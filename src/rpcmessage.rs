use std::collections::BTreeMap;
use std::fmt;

use crate::constants::*;
use crate::error::Error;
use crate::value::{MetaMap, RpcValue, Value};

/** View over an RpcValue whose payload is an IMap and whose meta is present.

Classification by the reserved meta keys: RequestId and Method present means
a request, RequestId alone a response, Method alone a signal. */
#[derive(Debug, Clone, PartialEq)]
pub struct RpcMessage {
    val: RpcValue,
}

impl Default for RpcMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcMessage {
    pub fn new() -> RpcMessage {
        RpcMessage {
            val: RpcValue {
                meta: Some(MetaMap::new()),
                value: Value::IMap(BTreeMap::new()),
            },
        }
    }

    pub fn new_request(
        shv_path: Option<&str>,
        method: &str,
        params: Option<RpcValue>,
        request_id: i64,
    ) -> RpcMessage {
        let mut msg = RpcMessage::new();
        msg.set_shv_path(shv_path);
        msg.set_method(Some(method));
        msg.set_params(params);
        msg.set_request_id(request_id);
        msg
    }

    pub fn from_value(mut val: RpcValue) -> Result<RpcMessage, Error> {
        if val.meta.is_none() {
            val.meta = Some(MetaMap::new());
        }
        match val.value {
            Value::IMap(_) => Ok(RpcMessage { val }),
            Value::Null => {
                val.value = Value::IMap(BTreeMap::new());
                Ok(RpcMessage { val })
            }
            _ => Err(Error::MalformedInput(
                "rpc message payload must be an imap".into(),
            )),
        }
    }

    pub fn value(&self) -> &RpcValue {
        &self.val
    }

    pub fn into_value(self) -> RpcValue {
        self.val
    }

    fn meta_mut(&mut self) -> &mut MetaMap {
        self.val.meta.get_or_insert_with(MetaMap::new)
    }

    fn payload(&self) -> Option<&BTreeMap<i64, RpcValue>> {
        self.val.as_imap()
    }

    fn payload_mut(&mut self) -> &mut BTreeMap<i64, RpcValue> {
        if !matches!(self.val.value, Value::IMap(_)) {
            self.val.value = Value::IMap(BTreeMap::new());
        }
        match &mut self.val.value {
            Value::IMap(m) => m,
            _ => unreachable!(),
        }
    }

    pub fn is_request(&self) -> bool {
        self.request_id().is_some() && self.method().is_some()
    }

    pub fn is_response(&self) -> bool {
        self.request_id().is_some() && self.method().is_none()
    }

    pub fn is_signal(&self) -> bool {
        self.request_id().is_none() && self.method().is_some()
    }

    /** Fresh response for this request: same RequestId and CallerIds, no
    Method. Result or Error is left for the caller to set. */
    pub fn make_response(&self) -> Result<RpcMessage, Error> {
        if !self.is_request() {
            return Err(Error::InvalidValue(
                "response can be created from request only".into(),
            ));
        }
        let mut resp = RpcMessage::new();
        if let Some(rqid) = self.request_id() {
            resp.set_request_id(rqid);
        }
        resp.set_caller_ids(self.caller_ids().cloned());
        Ok(resp)
    }

    pub fn request_id(&self) -> Option<i64> {
        self.val.meta.as_ref()?.get_int(TAG_REQUEST_ID)?.as_int()
    }

    pub fn set_request_id(&mut self, request_id: i64) {
        self.meta_mut()
            .insert_int(TAG_REQUEST_ID, RpcValue::from(request_id));
    }

    pub fn shv_path(&self) -> Option<&str> {
        self.val.meta.as_ref()?.get_int(TAG_SHV_PATH)?.as_str()
    }

    pub fn set_shv_path(&mut self, shv_path: Option<&str>) {
        match shv_path {
            Some(path) => self
                .meta_mut()
                .insert_int(TAG_SHV_PATH, RpcValue::from(path)),
            None => {
                self.meta_mut().remove_int(TAG_SHV_PATH);
            }
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.val.meta.as_ref()?.get_int(TAG_METHOD)?.as_str()
    }

    pub fn set_method(&mut self, method: Option<&str>) {
        match method {
            Some(m) => self.meta_mut().insert_int(TAG_METHOD, RpcValue::from(m)),
            None => {
                self.meta_mut().remove_int(TAG_METHOD);
            }
        }
    }

    pub fn caller_ids(&self) -> Option<&RpcValue> {
        self.val.meta.as_ref()?.get_int(TAG_CALLER_IDS)
    }

    pub fn set_caller_ids(&mut self, caller_ids: Option<RpcValue>) {
        match caller_ids {
            Some(ids) => self.meta_mut().insert_int(TAG_CALLER_IDS, ids),
            None => {
                self.meta_mut().remove_int(TAG_CALLER_IDS);
            }
        }
    }

    pub fn params(&self) -> Option<&RpcValue> {
        self.payload()?.get(&KEY_PARAMS)
    }

    pub fn set_params(&mut self, params: Option<RpcValue>) {
        match params {
            Some(p) => {
                self.payload_mut().insert(KEY_PARAMS, p);
            }
            None => {
                self.payload_mut().remove(&KEY_PARAMS);
            }
        }
    }

    pub fn result(&self) -> Option<&RpcValue> {
        self.payload()?.get(&KEY_RESULT)
    }

    pub fn set_result(&mut self, result: Option<RpcValue>) {
        match result {
            Some(r) => {
                self.payload_mut().insert(KEY_RESULT, r);
            }
            None => {
                self.payload_mut().remove(&KEY_RESULT);
            }
        }
    }

    pub fn error(&self) -> Option<&RpcValue> {
        self.payload()?.get(&KEY_ERROR)
    }

    pub fn set_error(&mut self, error: Option<RpcValue>) {
        match error {
            Some(e) => {
                self.payload_mut().insert(KEY_ERROR, e);
            }
            None => {
                self.payload_mut().remove(&KEY_ERROR);
            }
        }
    }

    pub fn to_chainpack(&self) -> Result<Vec<u8>, Error> {
        self.val.to_chainpack()
    }

    pub fn to_cpon(&self) -> Result<Vec<u8>, Error> {
        self.val.to_cpon()
    }

    pub fn to_cpon_string(&self) -> String {
        self.val.to_cpon_string()
    }

    pub fn from_chainpack(data: &[u8]) -> Result<RpcMessage, Error> {
        RpcMessage::from_value(RpcValue::from_chainpack(data)?)
    }
}

impl fmt::Display for RpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.val)
    }
}
