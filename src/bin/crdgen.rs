use fnstack_k8s::crd::{Function, Profile};
use kube::CustomResourceExt;

fn main() {
    print!("{}", serde_yaml::to_string(&Function::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&Profile::crd()).unwrap());
}
