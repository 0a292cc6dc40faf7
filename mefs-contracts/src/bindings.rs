//! ABI of the on-chain contracts this client talks to.
//!
//! Only method names, argument order and return tuples matter here; the
//! bytecode is supplied separately through [`crate::ContractArtifacts`].

use alloy::sol;

sol! {
    #[derive(Debug)]
    contract Indexer {
        event HasAlready(string key, address addr);

        function add(string key, address addr) external;
        function get(string key) external view returns (address owner, address addr);
    }

    #[derive(Debug)]
    contract Resolver {
        event HasAlready(address owner, address mapper);

        function add(address owner, address mapper) external;
        function get(address owner) external view returns (address mapper);
        function alterOwner(address newOwner) external;
        function setBanned(address owner, bool banned) external;
        function isBanned(address owner) external view returns (bool banned);
    }

    #[derive(Debug)]
    contract Mapper {
        function add(address addr) external;
        function get() external view returns (address[] addrs);
    }

    #[derive(Debug)]
    contract KeeperRegistry {
        function set(address keeper, bool isKeeper) external;
        function setBanned(address keeper, bool banned) external;
        function pledge() external payable;
        function setPrice(uint256 price) external;
        function setPledgePrice(uint256 price) external;
        function getPledgePrice() external view returns (uint256 price);
        function info(address keeper) external view returns (bool isKeeper, bool isBanned, uint256 staked, uint256 time, uint256 price);
        function getAllAddress() external view returns (address[] addrs);
    }

    #[derive(Debug)]
    contract ProviderRegistry {
        function set(address provider, bool isProvider) external;
        function setBanned(address provider, bool banned) external;
        function pledge(uint256 size) external payable;
        function setPrice(uint256 price) external;
        function setPledgePrice(uint256 ratio) external;
        function getPledgePrice() external view returns (uint256 ratio);
        function info(address provider) external view returns (bool isProvider, bool isBanned, uint256 staked, uint256 time, uint256 price);
        function getAllAddress() external view returns (address[] addrs);
    }

    #[derive(Debug)]
    contract KeeperProviderMap {
        function add(address keeper, address[] providers) external;
        function deleteKeeper(address keeper) external;
        function deleteProvider(address keeper, address provider) external;
        function getProviders(address keeper) external view returns (address[] providers);
        function getKeepers() external view returns (address[] keepers);
    }

    #[derive(Debug)]
    contract Channel {
        constructor(address payee, uint256 duration) payable;

        function closeChannel(uint256 value, bytes sig) external;
        function channelTimeout() external;
        function getInfo() external view returns (address payer, address payee, uint256 balance, uint256 expiry);
    }

    #[derive(Debug)]
    contract UpKeeping {
        constructor(address query, address[] keepers, address[] providers, uint256 duration, uint256 size, uint256 price, uint256 cycle) payable;

        function addProvider(address[] providers, bytes[] signs) external;
        function spaceTimePay(address provider, uint256 start, uint256 length, uint256 value, bytes32 root, uint8[] share, bytes[] signs) external;
        function extendTime(uint256 addTime, bytes[] signs) external payable;
        function setKeeperStop(address keeper, bytes[] signs) external;
        function setProviderStop(address provider, bytes[] signs) external;
        function destruct() external;
        function getOrder() external view returns (address query, address user, uint256 duration, uint256 size, uint256 price, uint256 cycle, uint256 createDate, uint256 paid);
        function getKeepers() external view returns (address[] keepers, bool[] stopped);
        function getProviders() external view returns (address[] providers, bool[] stopped, uint256[] paid, uint256[] paidUntil);
    }

    #[derive(Debug)]
    contract Root {
        function setRoot(int64 key, bytes32 root) external;
        function getRoot(int64 key) external view returns (bytes32 root);
        function getLatest() external view returns (int64 key, bytes32 root);
    }
}
