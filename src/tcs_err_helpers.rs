#![macro_use]

#[allow(unused)]
macro_rules! tcs_rc {
    ($rc:ident) => {
        crate::interface::TcsRc::$rc
    };
}

#[allow(unused)]
macro_rules! tcs_err_rc {
    ($rc:ident) => {
        crate::interface::TcsErr::Rc(tcs_rc!($rc))
    };
}

#[allow(unused)]
macro_rules! tcs_err_internal {
    () => {
        crate::interface::TcsErr::InternalErr {}
    };
}
