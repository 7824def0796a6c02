macro_rules! format_error {
    ($e:expr) => {
        return Err($crate::Error::Format(($e).to_string()))
    };
    ($fmt:expr, $($arg:tt)+) => {
        return Err($crate::Error::Format(format!($fmt, $($arg)+)))
    };
}

macro_rules! corrupt {
    ($e:expr) => {
        return Err($crate::Error::Corrupt(($e).to_string()))
    };
    ($fmt:expr, $($arg:tt)+) => {
        return Err($crate::Error::Corrupt(format!($fmt, $($arg)+)))
    };
}
