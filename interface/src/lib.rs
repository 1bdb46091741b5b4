/*!
# ao-interface

Interface definition between the adaptive optics loop driver and the loop clients
(the wavefront sensor and the control law).

Data is passed from the driver to a client by invoking [Read::read] on the client.

Data is passed from a client to the driver by invoking [Write::write] on the client.

The client state is updated by invoking [Update::update] on the client.

A chain link of the loop is always executed in the same order:
[Read] the inputs, [Update] the client, [Write] the outputs.
*/

mod data;
pub use data::Data;

/// Defines the data type associated with unique identifier data type
pub trait UniqueIdentifier: Send + Sync {
    type DataType: Send + Sync;
}
impl UniqueIdentifier for () {
    type DataType = ();
}

/// Declares unique identifiers
///
/// ```
/// use ao_interface::{uid, UniqueIdentifier};
///
/// uid! {
///     /// Horizontal slopes
///     XSlopes: Vec<f64>
/// }
/// let _: <XSlopes as UniqueIdentifier>::DataType = vec![0f64; 3];
/// ```
#[macro_export]
macro_rules! uid {
    ($($(#[$meta:meta])* $name:ident : $ty:ty),+ $(,)?) => {
        $(
            $(#[$meta])*
            pub enum $name {}
            impl $crate::UniqueIdentifier for $name {
                type DataType = $ty;
            }
        )+
    };
}

/// Client state update interface
pub trait Update: Send {
    fn update(&mut self) {}
}
/// Client input data reader interface
pub trait Read<U: UniqueIdentifier>: Update {
    /// Read data from an input
    fn read(&mut self, data: Data<U>);
}
/// Client output data writer interface
pub trait Write<U: UniqueIdentifier>: Update {
    fn write(&mut self) -> Option<Data<U>>;
}

use log::{info, warn};

/// Pretty prints error message
///
/// With an error, the message and the chain of error sources are
/// logged as a single warning, otherwise the message is logged as information.
pub fn print_info<S: Into<String>>(msg: S, e: Option<&dyn std::error::Error>) {
    if let Some(e) = e {
        let mut msg: Vec<String> = vec![msg.into()];
        msg.push(format!("{}", e));
        let mut current = e.source();
        while let Some(cause) = current {
            msg.push(format!("{}", cause));
            current = cause.source();
        }
        warn!("{}", msg.join("\n .due to: "))
    } else {
        info!("{}", msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    uid! {
        Samples: Vec<f64>
    }

    struct Doubler(Vec<f64>);
    impl Update for Doubler {
        fn update(&mut self) {
            self.0.iter_mut().for_each(|x| *x *= 2.);
        }
    }
    impl Read<Samples> for Doubler {
        fn read(&mut self, data: Data<Samples>) {
            self.0 = data.into();
        }
    }
    impl Write<Samples> for Doubler {
        fn write(&mut self) -> Option<Data<Samples>> {
            Some(self.0.clone().into())
        }
    }

    #[test]
    fn read_update_write() {
        let mut client = Doubler(vec![]);
        <Doubler as Read<Samples>>::read(&mut client, vec![1., 2.].into());
        client.update();
        let y = <Doubler as Write<Samples>>::write(&mut client).unwrap();
        assert_eq!(*y, vec![2., 4.]);
    }
}
